//! CAN-FIX message codec
//!
//! Maps raw frames to typed messages by identifier range and, for
//! node-specific traffic, by control code.

use std::fmt;

use super::error::{CodecError, CodecResult};
use super::{code, id};
use crate::transport::CanFrame;

/// Identity triple carried by a node identification response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub device_type: u8,
    pub firmware_version: u8,
    pub model: u32,
}

/// Parameter function-code flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Function(pub u8);

impl Function {
    pub fn annunciate(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn quality(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn failure(self) -> bool {
        self.0 & 0x04 != 0
    }

    /// Metadata slot, 0 for a plain value
    pub fn meta(self) -> u8 {
        self.0 >> 4
    }

    pub fn from_flags(annunciate: bool, quality: bool, failure: bool) -> Self {
        Self(annunciate as u8 | (quality as u8) << 1 | (failure as u8) << 2)
    }

    pub fn with_meta(self, meta: u8) -> Self {
        Self((self.0 & 0x0F) | (meta << 4))
    }
}

/// Parameter update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterFrame {
    pub id: u16,
    pub node: u8,
    pub index: u8,
    pub function: Function,
    pub data: Vec<u8>,
}

/// Node configuration set or query, request or response
///
/// A query response carrying one value byte has the same length as a query
/// request, so the body is kept raw and read according to the exchange
/// direction the caller expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFrame {
    pub sender: u8,
    pub dest: u8,
    /// Data after the control code and destination
    pub body: Vec<u8>,
}

impl ConfigFrame {
    pub fn set_request(sender: u8, dest: u8, key: u16, value: &[u8]) -> Self {
        let mut body = key.to_le_bytes().to_vec();
        body.extend_from_slice(value);
        Self { sender, dest, body }
    }

    pub fn query_request(sender: u8, dest: u8, key: u16) -> Self {
        Self {
            sender,
            dest,
            body: key.to_le_bytes().to_vec(),
        }
    }

    pub fn response(sender: u8, dest: u8, status: u8, value: &[u8]) -> Self {
        let mut body = vec![status];
        body.extend_from_slice(value);
        Self { sender, dest, body }
    }

    /// Key of a request
    pub fn key(&self) -> Option<u16> {
        match self.body.as_slice() {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    /// Value bytes of a set request
    pub fn request_value(&self) -> &[u8] {
        self.body.get(2..).unwrap_or(&[])
    }

    /// Status byte of a response
    pub fn status(&self) -> Option<u8> {
        self.body.first().copied()
    }

    /// Value bytes of a query response
    pub fn response_value(&self) -> &[u8] {
        self.body.get(1..).unwrap_or(&[])
    }
}

/// Human readable configuration response status
pub fn config_status_text(status: u8) -> String {
    match status {
        0 => "Success".to_string(),
        1 => "Key Not Found".to_string(),
        2 => "Key Read Only".to_string(),
        3 => "Value Out of Range".to_string(),
        n => format!("Unknown Error {}", n),
    }
}

/// Decoded CAN-FIX message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    NodeAlarm {
        node: u8,
        alarm: u16,
        data: Vec<u8>,
    },
    Parameter(ParameterFrame),
    IdentifyRequest {
        sender: u8,
        dest: u8,
    },
    IdentifyResponse {
        sender: u8,
        dest: u8,
        identity: NodeIdentity,
    },
    NodeStatus {
        sender: u8,
        status_type: u16,
        value: Vec<u8>,
    },
    UpdateFirmwareRequest {
        sender: u8,
        dest: u8,
        code: u16,
        channel: u8,
    },
    UpdateFirmwareResponse {
        sender: u8,
        dest: u8,
        status: u8,
    },
    TwoWayRequest {
        sender: u8,
        dest: u8,
        channel: u8,
        connection_type: u16,
    },
    TwoWayResponse {
        sender: u8,
        dest: u8,
        status: u8,
    },
    ConfigSet(ConfigFrame),
    ConfigQuery(ConfigFrame),
    NodeDescription {
        sender: u8,
        dest: u8,
        packet: u16,
        chars: Vec<u8>,
    },
    /// Node-specific traffic this codec does not interpret
    NodeSpecific {
        sender: u8,
        code: u8,
        data: Vec<u8>,
    },
    /// Two-way channel data
    Channel {
        channel: u8,
        response: bool,
        data: Vec<u8>,
    },
}

fn need(kind: &'static str, data: &[u8], expected: usize) -> CodecResult<()> {
    if data.len() < expected {
        return Err(CodecError::TooShort {
            kind,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn le16(lo: u8, hi: u8) -> u16 {
    u16::from_le_bytes([lo, hi])
}

impl Message {
    /// Decode a frame
    pub fn parse(frame: &CanFrame) -> CodecResult<Self> {
        let d = frame.data.as_slice();
        match frame.id {
            0..=id::ALARM_MAX => {
                need("node alarm", d, 2)?;
                Ok(Message::NodeAlarm {
                    node: frame.id as u8,
                    alarm: le16(d[0], d[1]),
                    data: d[2..].to_vec(),
                })
            }
            id::PARAMETER_MIN..=id::PARAMETER_MAX => {
                need("parameter", d, 3)?;
                Ok(Message::Parameter(ParameterFrame {
                    id: frame.id,
                    node: d[0],
                    index: d[1],
                    function: Function(d[2]),
                    data: d[3..].to_vec(),
                }))
            }
            id::NODE_SPECIFIC_BASE..=id::NODE_SPECIFIC_MAX => {
                let sender = (frame.id - id::NODE_SPECIFIC_BASE) as u8;
                Self::parse_node_specific(sender, d)
            }
            id::CHANNEL_BASE..=id::CHANNEL_MAX => {
                let offset = frame.id - id::CHANNEL_BASE;
                Ok(Message::Channel {
                    channel: (offset / 2) as u8,
                    response: offset % 2 == 1,
                    data: d.to_vec(),
                })
            }
            other => Err(CodecError::UnknownId(other)),
        }
    }

    fn parse_node_specific(sender: u8, d: &[u8]) -> CodecResult<Self> {
        need("node specific message", d, 1)?;
        let control = d[0];
        match control {
            code::NODE_IDENTIFICATION => {
                need("node identification", d, 2)?;
                if d.len() >= 8 {
                    Ok(Message::IdentifyResponse {
                        sender,
                        dest: d[1],
                        identity: NodeIdentity {
                            device_type: d[3],
                            firmware_version: d[4],
                            model: u32::from_le_bytes([d[5], d[6], d[7], 0]),
                        },
                    })
                } else {
                    Ok(Message::IdentifyRequest { sender, dest: d[1] })
                }
            }
            code::NODE_STATUS => {
                need("node status", d, 3)?;
                Ok(Message::NodeStatus {
                    sender,
                    status_type: le16(d[1], d[2]),
                    value: d[3..].to_vec(),
                })
            }
            code::UPDATE_FIRMWARE => {
                need("update firmware", d, 3)?;
                if d.len() >= 5 {
                    Ok(Message::UpdateFirmwareRequest {
                        sender,
                        dest: d[1],
                        code: le16(d[2], d[3]),
                        channel: d[4],
                    })
                } else {
                    Ok(Message::UpdateFirmwareResponse {
                        sender,
                        dest: d[1],
                        status: d[2],
                    })
                }
            }
            code::TWO_WAY_CONNECTION => {
                need("two way connection", d, 3)?;
                if d.len() >= 5 {
                    Ok(Message::TwoWayRequest {
                        sender,
                        dest: d[1],
                        channel: d[2],
                        connection_type: le16(d[3], d[4]),
                    })
                } else {
                    Ok(Message::TwoWayResponse {
                        sender,
                        dest: d[1],
                        status: d[2],
                    })
                }
            }
            code::CONFIG_SET | code::CONFIG_QUERY => {
                need("node configuration", d, 3)?;
                let frame = ConfigFrame {
                    sender,
                    dest: d[1],
                    body: d[2..].to_vec(),
                };
                if control == code::CONFIG_SET {
                    Ok(Message::ConfigSet(frame))
                } else {
                    Ok(Message::ConfigQuery(frame))
                }
            }
            code::NODE_DESCRIPTION => {
                need("node description", d, 4)?;
                Ok(Message::NodeDescription {
                    sender,
                    dest: d[1],
                    packet: le16(d[2], d[3]),
                    chars: d[4..].to_vec(),
                })
            }
            _ => Ok(Message::NodeSpecific {
                sender,
                code: control,
                data: d[1..].to_vec(),
            }),
        }
    }

    /// Encode to a frame
    pub fn to_frame(&self) -> CodecResult<CanFrame> {
        let (frame_id, data) = match self {
            Message::NodeAlarm { node, alarm, data } => {
                if *node == 0 {
                    return Err(CodecError::InvalidField("alarm from node 0".to_string()));
                }
                let mut d = alarm.to_le_bytes().to_vec();
                d.extend_from_slice(data);
                (*node as u16, d)
            }
            Message::Parameter(p) => {
                if !(id::PARAMETER_MIN..=id::PARAMETER_MAX).contains(&p.id) {
                    return Err(CodecError::InvalidField(format!(
                        "parameter id 0x{:03X}",
                        p.id
                    )));
                }
                let mut d = vec![p.node, p.index, p.function.0];
                d.extend_from_slice(&p.data);
                (p.id, d)
            }
            Message::IdentifyRequest { sender, dest } => {
                (node_id(*sender), vec![code::NODE_IDENTIFICATION, *dest])
            }
            Message::IdentifyResponse {
                sender,
                dest,
                identity,
            } => {
                let m = identity.model.to_le_bytes();
                (
                    node_id(*sender),
                    vec![
                        code::NODE_IDENTIFICATION,
                        *dest,
                        super::CANFIX_VERSION,
                        identity.device_type,
                        identity.firmware_version,
                        m[0],
                        m[1],
                        m[2],
                    ],
                )
            }
            Message::NodeStatus {
                sender,
                status_type,
                value,
            } => {
                let t = status_type.to_le_bytes();
                let mut d = vec![code::NODE_STATUS, t[0], t[1]];
                d.extend_from_slice(value);
                (node_id(*sender), d)
            }
            Message::UpdateFirmwareRequest {
                sender,
                dest,
                code: verification,
                channel,
            } => {
                let c = verification.to_le_bytes();
                (
                    node_id(*sender),
                    vec![code::UPDATE_FIRMWARE, *dest, c[0], c[1], *channel],
                )
            }
            Message::UpdateFirmwareResponse {
                sender,
                dest,
                status,
            } => (node_id(*sender), vec![code::UPDATE_FIRMWARE, *dest, *status]),
            Message::TwoWayRequest {
                sender,
                dest,
                channel,
                connection_type,
            } => {
                let t = connection_type.to_le_bytes();
                (
                    node_id(*sender),
                    vec![code::TWO_WAY_CONNECTION, *dest, *channel, t[0], t[1]],
                )
            }
            Message::TwoWayResponse {
                sender,
                dest,
                status,
            } => (
                node_id(*sender),
                vec![code::TWO_WAY_CONNECTION, *dest, *status],
            ),
            Message::ConfigSet(c) => (node_id(c.sender), config_data(code::CONFIG_SET, c)),
            Message::ConfigQuery(c) => (node_id(c.sender), config_data(code::CONFIG_QUERY, c)),
            Message::NodeDescription {
                sender,
                dest,
                packet,
                chars,
            } => {
                let p = packet.to_le_bytes();
                let mut d = vec![code::NODE_DESCRIPTION, *dest, p[0], p[1]];
                d.extend_from_slice(chars);
                (node_id(*sender), d)
            }
            Message::NodeSpecific { sender, code, data } => {
                let mut d = vec![*code];
                d.extend_from_slice(data);
                (node_id(*sender), d)
            }
            Message::Channel {
                channel,
                response,
                data,
            } => (channel_id(*channel, *response)?, data.clone()),
        };
        Ok(CanFrame::new(frame_id, data)?)
    }

    /// Node that transmitted the message
    pub fn sender(&self) -> Option<u8> {
        match self {
            Message::NodeAlarm { node, .. } => Some(*node),
            Message::Parameter(p) => Some(p.node),
            Message::IdentifyRequest { sender, .. }
            | Message::IdentifyResponse { sender, .. }
            | Message::NodeStatus { sender, .. }
            | Message::UpdateFirmwareRequest { sender, .. }
            | Message::UpdateFirmwareResponse { sender, .. }
            | Message::TwoWayRequest { sender, .. }
            | Message::TwoWayResponse { sender, .. }
            | Message::NodeDescription { sender, .. }
            | Message::NodeSpecific { sender, .. } => Some(*sender),
            Message::ConfigSet(c) | Message::ConfigQuery(c) => Some(c.sender),
            Message::Channel { .. } => None,
        }
    }

    /// Short message kind for logs and listings
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NodeAlarm { .. } => "Node Alarm",
            Message::Parameter(_) => "Parameter",
            Message::IdentifyRequest { .. } | Message::IdentifyResponse { .. } => {
                "Node Identification"
            }
            Message::NodeStatus { .. } => "Node Status",
            Message::UpdateFirmwareRequest { .. } | Message::UpdateFirmwareResponse { .. } => {
                "Update Firmware"
            }
            Message::TwoWayRequest { .. } | Message::TwoWayResponse { .. } => {
                "Two Way Connection"
            }
            Message::ConfigSet(_) => "Node Configuration Set",
            Message::ConfigQuery(_) => "Node Configuration Query",
            Message::NodeDescription { .. } => "Node Description",
            Message::NodeSpecific { .. } => "Node Specific",
            Message::Channel { .. } => "Two Way Channel",
        }
    }
}

fn config_data(control: u8, c: &ConfigFrame) -> Vec<u8> {
    let mut d = vec![control, c.dest];
    d.extend_from_slice(&c.body);
    d
}

/// Identifier of node-specific traffic from `node`
pub fn node_id(node: u8) -> u16 {
    id::NODE_SPECIFIC_BASE + node as u16
}

/// Identifier of a two-way channel
pub fn channel_id(channel: u8, response: bool) -> CodecResult<u16> {
    if channel >= id::CHANNEL_COUNT {
        return Err(CodecError::InvalidField(format!("channel {}", channel)));
    }
    Ok(id::CHANNEL_BASE + 2 * channel as u16 + response as u16)
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Parameter(p) => write!(
                f,
                "Parameter 0x{:03X} node={} index={} fcb=0x{:02X} data={}",
                p.id,
                p.node,
                p.index,
                p.function.0,
                hex::encode_upper(&p.data)
            ),
            Message::IdentifyResponse {
                sender, identity, ..
            } => write!(
                f,
                "Node Identification from {}: device=0x{:02X} model=0x{:06X} version={}",
                sender, identity.device_type, identity.model, identity.firmware_version
            ),
            Message::NodeStatus {
                sender,
                status_type,
                value,
            } => write!(
                f,
                "Node Status from {}: type={} value={}",
                sender,
                status_type,
                hex::encode_upper(value)
            ),
            other => match other.sender() {
                Some(s) => write!(f, "{} from {}", other.kind(), s),
                None => f.write_str(other.kind()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(id, data.to_vec()).unwrap()
    }

    #[test]
    fn test_parse_parameter() {
        let msg = Message::parse(&frame(0x183, &[0x05, 0x00, 0x06, 0xE8, 0x03])).unwrap();
        let Message::Parameter(p) = msg else {
            panic!("expected parameter");
        };
        assert_eq!(p.node, 5);
        assert_eq!(p.index, 0);
        assert!(p.function.quality());
        assert!(p.function.failure());
        assert!(!p.function.annunciate());
        assert_eq!(p.function.meta(), 0);
        assert_eq!(p.data, vec![0xE8, 0x03]);
    }

    #[test]
    fn test_parse_identify_response() {
        let msg =
            Message::parse(&frame(0x6E5, &[0x00, 0xFF, 0x01, 0x10, 0x02, 0x2B, 0x1A, 0x00]))
                .unwrap();
        assert_eq!(
            msg,
            Message::IdentifyResponse {
                sender: 5,
                dest: 0xFF,
                identity: NodeIdentity {
                    device_type: 0x10,
                    firmware_version: 2,
                    model: 0x001A2B,
                },
            }
        );
    }

    #[test]
    fn test_identify_request_bytes() {
        let f = Message::IdentifyRequest {
            sender: 0xFF,
            dest: 5,
        }
        .to_frame()
        .unwrap();
        assert_eq!(f.id, 0x7DF);
        assert_eq!(f.data, vec![0x00, 0x05]);
    }

    #[rstest]
    #[case(Message::NodeStatus { sender: 3, status_type: 0, value: vec![0x02, 0x00] })]
    #[case(Message::UpdateFirmwareRequest { sender: 0xFF, dest: 3, code: 0x1234, channel: 1 })]
    #[case(Message::UpdateFirmwareResponse { sender: 3, dest: 0xFF, status: 0 })]
    #[case(Message::TwoWayRequest { sender: 0xFF, dest: 3, channel: 2, connection_type: 0x10 })]
    #[case(Message::NodeDescription { sender: 3, dest: 0, packet: 2, chars: b"EFIS".to_vec() })]
    #[case(Message::Channel { channel: 3, response: true, data: vec![1, 2] })]
    #[case(Message::NodeAlarm { node: 7, alarm: 0x0102, data: vec![] })]
    fn test_frame_round_trip(#[case] msg: Message) {
        let f = msg.to_frame().unwrap();
        assert_eq!(Message::parse(&f).unwrap(), msg);
    }

    #[test]
    fn test_config_frames() {
        let set = Message::ConfigSet(ConfigFrame::set_request(0xFF, 3, 0x0102, &[0x2C, 0x01]))
            .to_frame()
            .unwrap();
        assert_eq!(set.data, vec![0x09, 0x03, 0x02, 0x01, 0x2C, 0x01]);

        let resp = Message::parse(&frame(0x6E3, &[0x0A, 0xFF, 0x00, 0x2C])).unwrap();
        let Message::ConfigQuery(c) = resp else {
            panic!("expected query");
        };
        assert_eq!(c.status(), Some(0));
        assert_eq!(c.response_value(), &[0x2C]);
        // Same bytes read as a request
        assert_eq!(c.key(), Some(0x2C00));
    }

    #[test]
    fn test_channel_ids() {
        assert_eq!(channel_id(0, false).unwrap(), 0x7E0);
        assert_eq!(channel_id(0, true).unwrap(), 0x7E1);
        assert_eq!(channel_id(15, true).unwrap(), 0x7FF);
        assert!(channel_id(16, false).is_err());
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(matches!(
            Message::parse(&frame(0x183, &[0x05])),
            Err(CodecError::TooShort { .. })
        ));
        assert!(Message::parse(&frame(0x6E5, &[])).is_err());
        assert!(Message::parse(&frame(0x6E5, &[0x06, 0x00])).is_err());
    }

    #[test]
    fn test_unknown_code_kept() {
        let msg = Message::parse(&frame(0x6E5, &[0x0C, 1, 2])).unwrap();
        assert_eq!(
            msg,
            Message::NodeSpecific {
                sender: 5,
                code: 0x0C,
                data: vec![1, 2]
            }
        );
    }
}
