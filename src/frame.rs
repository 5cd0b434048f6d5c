//! # Frame Codec - Text Frames on the Wire
//!
//! Converts between raw `;`-delimited ASCII radio frames and typed [`Packet`]
//! values. The codec is pure and stateless: decoding never fails, it only
//! degrades to [`Packet::Unknown`], which the engine drops with a log.
//!
//! Frames frequently arrive prefixed with a transport echo tag (`LORA_TX;`)
//! or leading noise bytes, so [`decode`] scans for the earliest occurrence of
//! a known keyword and decodes from there.
//!
//! ## Frame formats
//!
//! ```text
//! MSG;msgId;user;ttl;timestamp;object;function;parameters
//! BCAST;msgId;user;ttl;content          (legacy: BCAST;user;ttl;content)
//! BEACON;name
//! PING;...                              PONG;name;timestamp
//! ACK;msgId;name;object;function;timestamp
//! REQ;USERS;name                        REQ;PAGES;name
//! RESP;USERS;payload                    RESP;USERS;PART;idx;total;payload
//! RESP;PAGES;payload                    RESP;PAGES;PART;idx;total;payload
//! RESP;PAGE;team;idx;total;updatedAt;chunk
//! ```
//!
//! `parameters`, `content`, `payload` and `chunk` are greedy tail fields and
//! may contain further `;` characters. `team` and `updatedAt` in `RESP;PAGE`
//! are url-encoded so they cannot collide with the field separator.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::{MAX_FRAME_LEN, MAX_PAGE_HTML_LEN};

/// One raw radio frame, bounded by the hardware packet size.
pub type RawFrame = String<MAX_FRAME_LEN>;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Encoded frame would exceed `MAX_FRAME_LEN`.
    TooLong,
    /// `Packet::Unknown` has no wire representation.
    Unencodable,
    /// Url-decoded bytes are not valid UTF-8.
    InvalidText,
}

/// A decoded radio frame. Borrows from the raw frame text; constructed on
/// receive and consumed within one dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Msg {
        msg_id: &'a str,
        user: &'a str,
        ttl: u8,
        timestamp: u32,
        object: &'a str,
        function: &'a str,
        parameters: &'a str,
    },
    Bcast {
        /// `None` for the legacy four-field form; the engine synthesizes one.
        msg_id: Option<&'a str>,
        user: &'a str,
        ttl: u8,
        content: &'a str,
    },
    Beacon {
        name: &'a str,
    },
    Ping {
        rest: &'a str,
    },
    Pong {
        name: &'a str,
        timestamp: &'a str,
    },
    Ack {
        msg_id: &'a str,
        name: &'a str,
        object: &'a str,
        function: &'a str,
        timestamp: &'a str,
    },
    ReqUsers {
        name: &'a str,
    },
    ReqPages {
        name: &'a str,
    },
    RespUsers {
        payload: &'a str,
    },
    RespUsersPart {
        index: u32,
        total: u32,
        payload: &'a str,
    },
    RespPages {
        payload: &'a str,
    },
    RespPagesPart {
        index: u32,
        total: u32,
        payload: &'a str,
    },
    RespPage {
        /// Url-encoded team name.
        team: &'a str,
        index: u32,
        total: u32,
        /// Url-encoded timestamp string.
        updated_at: &'a str,
        chunk: &'a str,
    },
    Unknown,
}

const KEYWORDS: [&str; 8] = ["MSG;", "BCAST;", "BEACON;", "PING;", "PONG;", "ACK;", "REQ;", "RESP;"];

/// Finds the earliest known keyword in the raw frame, skipping any transport
/// echo prefix or noise before it.
fn locate_keyword(raw: &str) -> Option<(&'static str, &str)> {
    let mut best: Option<(usize, &'static str)> = None;
    for keyword in KEYWORDS {
        if let Some(pos) = raw.find(keyword) {
            if best.map_or(true, |(best_pos, _)| pos < best_pos) {
                best = Some((pos, keyword));
            }
        }
    }
    best.map(|(pos, keyword)| (keyword, &raw[pos + keyword.len()..]))
}

/// Splits `body` into exactly `N` fields, the last one greedy. Returns `None`
/// if there are fewer than `N` fields.
fn split_fields<'a, const N: usize>(body: &'a str) -> Option<[&'a str; N]> {
    let mut fields = [""; N];
    let mut rest = body;
    for slot in fields.iter_mut().take(N - 1) {
        let (field, tail) = rest.split_once(';')?;
        *slot = field;
        rest = tail;
    }
    fields[N - 1] = rest;
    Some(fields)
}

/// Decodes one raw frame. Unrecognized, truncated or unparseable frames
/// decode to [`Packet::Unknown`]; this function never fails.
pub fn decode(raw: &str) -> Packet<'_> {
    let Some((keyword, body)) = locate_keyword(raw) else {
        return Packet::Unknown;
    };

    match keyword {
        "MSG;" => decode_msg(body),
        "BCAST;" => decode_bcast(body),
        "BEACON;" => Packet::Beacon { name: body },
        "PING;" => Packet::Ping { rest: body },
        "PONG;" => match split_fields::<2>(body) {
            Some([name, timestamp]) => Packet::Pong { name, timestamp },
            None => Packet::Pong { name: body, timestamp: "" },
        },
        "ACK;" => match split_fields::<5>(body) {
            Some([msg_id, name, object, function, timestamp]) => Packet::Ack {
                msg_id,
                name,
                object,
                function,
                timestamp,
            },
            None => Packet::Unknown,
        },
        "REQ;" => match split_fields::<2>(body) {
            Some(["USERS", name]) => Packet::ReqUsers { name },
            Some(["PAGES", name]) => Packet::ReqPages { name },
            _ => Packet::Unknown,
        },
        "RESP;" => decode_resp(body),
        _ => Packet::Unknown,
    }
}

fn decode_msg(body: &str) -> Packet<'_> {
    let Some([msg_id, user, ttl, timestamp, object, function, parameters]) = split_fields::<7>(body) else {
        return Packet::Unknown;
    };
    let (Ok(ttl), Ok(timestamp)) = (ttl.parse::<u8>(), timestamp.parse::<u32>()) else {
        return Packet::Unknown;
    };
    Packet::Msg {
        msg_id,
        user,
        ttl,
        timestamp,
        object,
        function,
        parameters,
    }
}

fn decode_bcast(body: &str) -> Packet<'_> {
    // Five-field modern form first, then the legacy form without a msgId.
    if let Some([msg_id, user, ttl, content]) = split_fields::<4>(body) {
        if let Ok(ttl) = ttl.parse::<u8>() {
            return Packet::Bcast {
                msg_id: Some(msg_id),
                user,
                ttl,
                content,
            };
        }
    }
    if let Some([user, ttl, content]) = split_fields::<3>(body) {
        if let Ok(ttl) = ttl.parse::<u8>() {
            return Packet::Bcast {
                msg_id: None,
                user,
                ttl,
                content,
            };
        }
    }
    Packet::Unknown
}

fn decode_resp(body: &str) -> Packet<'_> {
    let Some((dataset, rest)) = body.split_once(';') else {
        return Packet::Unknown;
    };
    match dataset {
        "USERS" | "PAGES" => {
            if let Some(part_body) = rest.strip_prefix("PART;") {
                let Some([index, total, payload]) = split_fields::<3>(part_body) else {
                    return Packet::Unknown;
                };
                let (Ok(index), Ok(total)) = (index.parse::<u32>(), total.parse::<u32>()) else {
                    return Packet::Unknown;
                };
                if dataset == "USERS" {
                    Packet::RespUsersPart { index, total, payload }
                } else {
                    Packet::RespPagesPart { index, total, payload }
                }
            } else if dataset == "USERS" {
                Packet::RespUsers { payload: rest }
            } else {
                Packet::RespPages { payload: rest }
            }
        }
        "PAGE" => {
            let Some([team, index, total, updated_at, chunk]) = split_fields::<5>(rest) else {
                return Packet::Unknown;
            };
            let (Ok(index), Ok(total)) = (index.parse::<u32>(), total.parse::<u32>()) else {
                return Packet::Unknown;
            };
            Packet::RespPage {
                team,
                index,
                total,
                updated_at,
                chunk,
            }
        }
        _ => Packet::Unknown,
    }
}

/// Encodes a packet in the exact inverse field order of [`decode`].
pub fn encode(packet: &Packet<'_>) -> Result<RawFrame, FrameError> {
    let mut frame = RawFrame::new();
    let result = match packet {
        Packet::Msg {
            msg_id,
            user,
            ttl,
            timestamp,
            object,
            function,
            parameters,
        } => write!(
            frame,
            "MSG;{msg_id};{user};{ttl};{timestamp};{object};{function};{parameters}"
        ),
        Packet::Bcast {
            msg_id: Some(msg_id),
            user,
            ttl,
            content,
        } => write!(frame, "BCAST;{msg_id};{user};{ttl};{content}"),
        Packet::Bcast {
            msg_id: None,
            user,
            ttl,
            content,
        } => write!(frame, "BCAST;{user};{ttl};{content}"),
        Packet::Beacon { name } => write!(frame, "BEACON;{name}"),
        Packet::Ping { rest } => write!(frame, "PING;{rest}"),
        Packet::Pong { name, timestamp } => write!(frame, "PONG;{name};{timestamp}"),
        Packet::Ack {
            msg_id,
            name,
            object,
            function,
            timestamp,
        } => write!(frame, "ACK;{msg_id};{name};{object};{function};{timestamp}"),
        Packet::ReqUsers { name } => write!(frame, "REQ;USERS;{name}"),
        Packet::ReqPages { name } => write!(frame, "REQ;PAGES;{name}"),
        Packet::RespUsers { payload } => write!(frame, "RESP;USERS;{payload}"),
        Packet::RespUsersPart { index, total, payload } => {
            write!(frame, "RESP;USERS;PART;{index};{total};{payload}")
        }
        Packet::RespPages { payload } => write!(frame, "RESP;PAGES;{payload}"),
        Packet::RespPagesPart { index, total, payload } => {
            write!(frame, "RESP;PAGES;PART;{index};{total};{payload}")
        }
        Packet::RespPage {
            team,
            index,
            total,
            updated_at,
            chunk,
        } => write!(frame, "RESP;PAGE;{team};{index};{total};{updated_at};{chunk}"),
        Packet::Unknown => return Err(FrameError::Unencodable),
    };
    result.map_err(|_| FrameError::TooLong)?;
    Ok(frame)
}

/// Decodes `+` to space and `%XX` hex escapes, byte-wise, so multi-byte
/// UTF-8 escape sequences reassemble correctly. Returns `Err` when the
/// decoded text does not fit `N`, so oversized records can be dropped whole
/// instead of stored truncated, or when the bytes are not valid UTF-8.
pub(crate) fn url_decode<const N: usize>(input: &str) -> Result<String<N>, FrameError> {
    let mut output: Vec<u8, N> = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let decoded = match bytes[i] {
            b'+' => {
                i += 1;
                b' '
            }
            // %XX needs two hex digits after the marker; malformed escapes
            // pass through literally.
            b'%' if i + 2 < bytes.len() => {
                match input.get(i + 1..i + 3).and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                    Some(value) => {
                        i += 3;
                        value
                    }
                    None => {
                        i += 1;
                        b'%'
                    }
                }
            }
            other => {
                i += 1;
                other
            }
        };
        output.push(decoded).map_err(|_| FrameError::TooLong)?;
    }
    String::from_utf8(output).map_err(|_| FrameError::InvalidText)
}

/// Url-decode sized for page html payloads.
pub(crate) fn url_decode_html(input: &str) -> Result<String<MAX_PAGE_HTML_LEN>, FrameError> {
    url_decode::<MAX_PAGE_HTML_LEN>(input)
}

/// Looks up one `key:value` entry in a comma-separated parameter list,
/// tolerating whitespace around keys and values.
pub(crate) fn find_param<'a>(parameters: &'a str, key: &str) -> Option<&'a str> {
    for item in parameters.split(',') {
        if let Some((item_key, value)) = item.split_once(':') {
            if item_key.trim() == key {
                return Some(value.trim());
            }
        }
    }
    None
}

/// A message is targeted at a node when any of the recognized targeting
/// parameters name it exactly.
pub(crate) fn is_targeted_at(parameters: &str, node_name: &str) -> bool {
    for key in ["node", "target", "nodeid"] {
        if let Some(value) = find_param(parameters, key) {
            return value == node_name;
        }
    }
    false
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn decode_full_msg_frame() {
        let packet = decode("MSG;m1;alice;2;1000;MSG;SEND;hello");
        assert_eq!(
            packet,
            Packet::Msg {
                msg_id: "m1",
                user: "alice",
                ttl: 2,
                timestamp: 1000,
                object: "MSG",
                function: "SEND",
                parameters: "hello",
            }
        );
    }

    #[test]
    fn decode_msg_with_semicolons_in_parameters() {
        let packet = decode("MSG;7;bob;3;42;USER;ADD;name:bob, pwdHash:h;x");
        match packet {
            Packet::Msg { parameters, .. } => assert_eq!(parameters, "name:bob, pwdHash:h;x"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn decode_skips_transport_echo_prefix() {
        let direct = decode("BCAST;99;carol;2;hi there");
        let echoed = decode("LORA_TX;BCAST;99;carol;2;hi there");
        assert_eq!(direct, echoed);
    }

    #[test]
    fn decode_skips_leading_noise() {
        let packet = decode("\u{1}\u{2}garbageBEACON;LoRA_AB12_v1");
        assert_eq!(packet, Packet::Beacon { name: "LoRA_AB12_v1" });
    }

    #[test]
    fn decode_legacy_bcast_without_msg_id() {
        let packet = decode("BCAST;carol;2;hello mesh");
        assert_eq!(
            packet,
            Packet::Bcast {
                msg_id: None,
                user: "carol",
                ttl: 2,
                content: "hello mesh",
            }
        );
    }

    #[test]
    fn decode_truncated_and_garbled_frames_to_unknown() {
        assert_eq!(decode("MSG;only;three;fields"), Packet::Unknown);
        assert_eq!(decode("MSG;m;u;not-a-ttl;1;O;F;p"), Packet::Unknown);
        assert_eq!(decode("completely unrelated noise"), Packet::Unknown);
        assert_eq!(decode("RESP;WEATHER;sunny"), Packet::Unknown);
        assert_eq!(decode(""), Packet::Unknown);
    }

    #[test]
    fn decode_sync_frames() {
        assert_eq!(decode("REQ;USERS;node-a"), Packet::ReqUsers { name: "node-a" });
        assert_eq!(decode("REQ;PAGES;node-a"), Packet::ReqPages { name: "node-a" });
        assert_eq!(
            decode("RESP;USERS;alice|h1|red;bob|h2|blue"),
            Packet::RespUsers {
                payload: "alice|h1|red;bob|h2|blue"
            }
        );
        assert_eq!(
            decode("RESP;USERS;PART;1;2;alice|h1|red;"),
            Packet::RespUsersPart {
                index: 1,
                total: 2,
                payload: "alice|h1|red;"
            }
        );
        assert_eq!(
            decode("RESP;PAGES;PART;3;9;red|%3Chtml%3E"),
            Packet::RespPagesPart {
                index: 3,
                total: 9,
                payload: "red|%3Chtml%3E"
            }
        );
        assert_eq!(
            decode("RESP;PAGE;red+team;2;4;2024-05-01T10%3A00;chunkdata"),
            Packet::RespPage {
                team: "red+team",
                index: 2,
                total: 4,
                updated_at: "2024-05-01T10%3A00",
                chunk: "chunkdata",
            }
        );
    }

    #[test]
    fn encode_is_inverse_of_decode() {
        let frames = [
            "MSG;m1;alice;2;1000;MSG;SEND;hello",
            "BCAST;55;bob;1;hi",
            "BEACON;node-a",
            "PONG;node-a;1234",
            "ACK;m1;node-a;MSG;SEND;999",
            "REQ;USERS;node-a",
            "RESP;USERS;PART;1;2;alice|h|t",
            "RESP;PAGE;red;1;3;2024;chunk",
        ];
        for raw in frames {
            let packet = decode(raw);
            assert_ne!(packet, Packet::Unknown, "frame failed to decode: {raw}");
            assert_eq!(encode(&packet).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn encode_rejects_unknown_and_oversized() {
        assert_eq!(encode(&Packet::Unknown), Err(FrameError::Unencodable));

        let oversized = "x".repeat(MAX_FRAME_LEN);
        let packet = Packet::Beacon { name: &oversized };
        assert_eq!(encode(&packet), Err(FrameError::TooLong));
    }

    #[test]
    fn url_decode_handles_escapes() {
        let decoded: String<64> = url_decode("%3Chtml%3E+hello%20world").unwrap();
        assert_eq!(decoded.as_str(), "<html> hello world");

        // Malformed escapes pass through literally.
        let decoded: String<16> = url_decode("100%").unwrap();
        assert_eq!(decoded.as_str(), "100%");
        let decoded: String<16> = url_decode("%zz").unwrap();
        assert_eq!(decoded.as_str(), "%zz");
    }

    #[test]
    fn url_decode_reassembles_multi_byte_escapes() {
        let decoded: String<16> = url_decode("caf%C3%A9").unwrap();
        assert_eq!(decoded.as_str(), "café");

        // A lone continuation byte is not valid UTF-8.
        assert_eq!(url_decode::<16>("%A9"), Err(FrameError::InvalidText));
    }

    #[test]
    fn url_decode_rejects_overflow() {
        assert!(url_decode::<4>("abcdef").is_err());
    }

    #[test]
    fn targeting_parameters() {
        assert!(is_targeted_at("node:alpha", "alpha"));
        assert!(is_targeted_at("foo:bar, target : alpha ", "alpha"));
        assert!(is_targeted_at("nodeid:alpha", "alpha"));
        assert!(!is_targeted_at("node:alpha", "Alpha"));
        assert!(!is_targeted_at("node:beta", "alpha"));
        assert!(!is_targeted_at("free text without params", "alpha"));
    }

    #[test]
    fn find_param_extracts_values() {
        let params = "name:bob, pwdHash:abc123, team:red, token:t0";
        assert_eq!(find_param(params, "name"), Some("bob"));
        assert_eq!(find_param(params, "team"), Some("red"));
        assert_eq!(find_param(params, "missing"), None);
    }
}
