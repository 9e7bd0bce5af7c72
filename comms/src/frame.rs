//! The frames exchanged with the broker and the registration endpoint.

use std::{borrow::Cow, io};

use crate::{Deserialize, Qos, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();
type RouteLen = u32;
const ROUTE_LEN_SIZE: usize = size_of::<RouteLen>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const PUBLISH: Header = 2;
const DELIVER: Header = 3;

/// The command for the `Control` variant of the `Frame` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Subscribe { id: u64, topic: String },
    Unsubscribe { id: u64, topic: String },
    /// Acknowledges the publish, subscribe or unsubscribe identified by `id`.
    Ack { id: u64 },
    Disconnect,
    Register { host_id: String },
    Registered { client_id: String },
    Join { client_id: String },
    Quit { client_id: String },
    Ok,
    Rejected { reason: String },
}

/// Where a published message goes and how it must be delivered.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Route<'a> {
    pub id: u64,
    #[serde(borrow)]
    pub topic: Cow<'a, str>,
    pub qos: Qos,
}

/// The framing layer message.
#[derive(Debug, PartialEq)]
pub enum Frame<'a> {
    Control(Command),
    /// A message published by a peer into the broker.
    Publish(Route<'a>, &'a [u8]),
    /// A message pushed by the broker to a subscriber.
    Deliver(Route<'a>, &'a [u8]),
    Err(Cow<'a, str>),
}

impl Frame<'_> {
    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid frame kind {kind}"),
        ))
    }
}

fn write_route(buf: &mut Vec<u8>, kind: Header, route: &Route) -> io::Result<()> {
    buf.extend_from_slice(&kind.to_be_bytes());

    let len_at = buf.len();
    buf.extend_from_slice(&[0; ROUTE_LEN_SIZE]);
    serde_json::to_writer(&mut *buf, route)?;

    let len = (buf.len() - len_at - ROUTE_LEN_SIZE) as RouteLen;
    buf[len_at..len_at + ROUTE_LEN_SIZE].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn read_route(buf: &[u8]) -> io::Result<(Route<'_>, &[u8])> {
    if buf.len() < ROUTE_LEN_SIZE {
        return Frame::buf_is_too_small(buf.len(), ROUTE_LEN_SIZE);
    }

    let (len_buf, rest) = buf.split_at(ROUTE_LEN_SIZE);
    let mut len = [0; ROUTE_LEN_SIZE];
    len.copy_from_slice(len_buf);
    let len = RouteLen::from_be_bytes(len) as usize;

    if rest.len() < len {
        return Frame::buf_is_too_small(rest.len(), len);
    }

    let (route, payload) = rest.split_at(len);
    let route = serde_json::from_slice(route)?;
    Ok((route, payload))
}

impl<'a> Serialize<'a> for Frame<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Frame::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Frame::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Frame::Publish(route, payload) => {
                write_route(buf, PUBLISH, route)?;
                Ok(Some(*payload))
            }
            Frame::Deliver(route, payload) => {
                write_route(buf, DELIVER, route)?;
                Ok(Some(*payload))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Frame<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            PUBLISH => {
                let (route, payload) = read_route(rest)?;
                Ok(Self::Publish(route, payload))
            }
            DELIVER => {
                let (route, payload) = read_route(rest)?;
                Ok(Self::Deliver(route, payload))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}

/// Creates an error for when an unexpected frame kind is received.
///
/// # Arguments
/// * `frame` - The received frame.
///
/// # Returns
/// An `InvalidData` io error.
pub fn unexpected_frame<T>(frame: &Frame) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Received an unexpected frame, got: {frame:?}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = frame.serialize(&mut buf).unwrap();
        buf.extend_from_slice(tail.unwrap_or_default());
        buf
    }

    #[test]
    fn test_publish_frame_keeps_route_and_payload() {
        let route = Route {
            id: 42,
            topic: Cow::Borrowed("/client/publish/a_1234"),
            qos: Qos::AtLeastOnce,
        };
        let payload = [1u8, 2, 3, 4, 5];
        let frame = Frame::Publish(route.clone(), &payload);

        let buf = encode(&frame);
        let decoded = Frame::deserialize(&buf).unwrap();

        assert_eq!(decoded, Frame::Publish(route, &payload));
    }

    #[test]
    fn test_truncated_route_is_rejected() {
        let mut buf = PUBLISH.to_be_bytes().to_vec();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"{}");

        let err = Frame::deserialize(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let buf = 9u32.to_be_bytes();
        assert!(Frame::deserialize(&buf).is_err());
    }
}
