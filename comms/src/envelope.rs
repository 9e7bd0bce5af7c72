//! The messages exchanged over the pub/sub topics.
//!
//! Every envelope is encoded as a `u32` kind, a `u32` metadata length, the JSON
//! metadata (including the layout of every tensor) and finally the raw `f32`
//! values of the parameter map in key order.

use std::io;

use model::ParameterMap;
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize, de::DeserializeOwned};

use crate::{Deserialize, Serialize, now_ms};

type Kind = u32;
const KIND_SIZE: usize = size_of::<Kind>();
type MetaLen = u32;
const META_LEN_SIZE: usize = size_of::<MetaLen>();
const F32_SIZE: usize = size_of::<f32>();

const BROADCAST: Kind = 1;
const RESULT: Kind = 2;

/// The round a broadcast belongs to, `current` is one based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub struct RoundInfo {
    pub current: usize,
    pub total: usize,
}

/// Execution hints for the clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub struct SysHints {
    pub device: String,
}

/// The payload the aggregator publishes to every joined client at round start.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub round: RoundInfo,
    pub global_model: ParameterMap,
    pub sys: SysHints,
    pub local_epochs: usize,
    pub sent_time_ms: u64,
}

/// The result a client publishes back after training.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope {
    /// Echoes `round.current` of the broadcast that triggered it.
    pub round_index: usize,
    pub client_id: String,
    pub parameters: ParameterMap,
    pub sent_time_ms: u64,
}

impl Broadcast {
    /// Milliseconds elapsed since the aggregator stamped this broadcast.
    pub fn comm_delay_ms(&self) -> u64 {
        now_ms().saturating_sub(self.sent_time_ms)
    }
}

impl ResultEnvelope {
    /// Milliseconds elapsed since the client stamped this result.
    pub fn comm_delay_ms(&self) -> u64 {
        now_ms().saturating_sub(self.sent_time_ms)
    }
}

#[derive(SerdeSerialize, SerdeDeserialize)]
struct BroadcastHeader {
    round: RoundInfo,
    sys: SysHints,
    local_epochs: usize,
    sent_time_ms: u64,
}

#[derive(SerdeSerialize, SerdeDeserialize)]
struct ResultHeader {
    round_index: usize,
    client_id: String,
    sent_time_ms: u64,
}

#[derive(SerdeSerialize, SerdeDeserialize)]
struct Meta<H> {
    #[serde(flatten)]
    header: H,
    layout: Vec<(String, Vec<usize>)>,
}

fn invalid<T>(detail: String) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, detail))
}

fn write_envelope<H>(buf: &mut Vec<u8>, kind: Kind, header: H, params: &ParameterMap) -> io::Result<()>
where
    H: SerdeSerialize,
{
    let layout = params
        .iter()
        .map(|(key, t)| (key.clone(), t.shape().to_vec()))
        .collect();

    buf.extend_from_slice(&kind.to_be_bytes());

    let len_at = buf.len();
    buf.extend_from_slice(&[0; META_LEN_SIZE]);
    serde_json::to_writer(&mut *buf, &Meta { header, layout })?;

    let len = (buf.len() - len_at - META_LEN_SIZE) as MetaLen;
    buf[len_at..len_at + META_LEN_SIZE].copy_from_slice(&len.to_be_bytes());

    buf.reserve(params.num_params() * F32_SIZE);
    for (_, tensor) in params {
        match tensor.as_slice() {
            Some(values) => buf.extend_from_slice(bytemuck::cast_slice(values)),
            None => tensor
                .iter()
                .for_each(|v| buf.extend_from_slice(bytemuck::bytes_of(v))),
        }
    }

    Ok(())
}

/// The amount of values a tensor of `shape` holds, `None` if it overflows.
fn tensor_len(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

fn overflow(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("the layout of {what} is too large to address"),
    )
}

fn read_envelope<H>(buf: &[u8], expected: Kind) -> io::Result<(H, ParameterMap)>
where
    H: DeserializeOwned,
{
    let needed = KIND_SIZE + META_LEN_SIZE;
    if buf.len() < needed {
        return invalid(format!("envelope of {} bytes, must at least be {needed}", buf.len()));
    }

    let (kind, rest) = buf.split_at(KIND_SIZE);
    let kind = Kind::from_be_bytes([kind[0], kind[1], kind[2], kind[3]]);
    if kind != expected {
        return invalid(format!("envelope kind {kind}, expected {expected}"));
    }

    let (len, rest) = rest.split_at(META_LEN_SIZE);
    let len = MetaLen::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return invalid(format!("envelope metadata of {len} bytes but only {} left", rest.len()));
    }

    let (meta, data) = rest.split_at(len);
    let Meta::<H> { header, layout } = serde_json::from_slice(meta)?;

    let sizes = layout
        .iter()
        .map(|(key, shape)| tensor_len(shape).ok_or_else(|| overflow(key)))
        .collect::<io::Result<Vec<usize>>>()?;

    let needed = sizes
        .iter()
        .try_fold(0usize, |acc, &size| acc.checked_add(size))
        .and_then(|total| total.checked_mul(F32_SIZE))
        .ok_or_else(|| overflow("the parameter map"))?;

    if data.len() != needed {
        return invalid(format!(
            "envelope carries {} bytes of parameters, layout needs {needed}",
            data.len()
        ));
    }

    let mut values = data
        .chunks_exact(F32_SIZE)
        .map(bytemuck::pod_read_unaligned::<f32>);

    let mut params = ParameterMap::new();
    for ((key, shape), size) in layout.into_iter().zip(sizes) {
        let tensor: Vec<f32> = values.by_ref().take(size).collect();

        params
            .insert_flat(key, &shape, tensor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }

    Ok((header, params))
}

impl<'a> Serialize<'a> for Broadcast {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        let header = BroadcastHeader {
            round: self.round,
            sys: self.sys.clone(),
            local_epochs: self.local_epochs,
            sent_time_ms: self.sent_time_ms,
        };

        write_envelope(buf, BROADCAST, header, &self.global_model)?;
        Ok(None)
    }
}

impl<'a> Deserialize<'a> for Broadcast {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let (header, global_model) = read_envelope::<BroadcastHeader>(buf, BROADCAST)?;

        Ok(Self {
            round: header.round,
            global_model,
            sys: header.sys,
            local_epochs: header.local_epochs,
            sent_time_ms: header.sent_time_ms,
        })
    }
}

impl<'a> Serialize<'a> for ResultEnvelope {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        let header = ResultHeader {
            round_index: self.round_index,
            client_id: self.client_id.clone(),
            sent_time_ms: self.sent_time_ms,
        };

        write_envelope(buf, RESULT, header, &self.parameters)?;
        Ok(None)
    }
}

impl<'a> Deserialize<'a> for ResultEnvelope {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let (header, parameters) = read_envelope::<ResultHeader>(buf, RESULT)?;

        Ok(Self {
            round_index: header.round_index,
            client_id: header.client_id,
            parameters,
            sent_time_ms: header.sent_time_ms,
        })
    }
}

/// Serializes `msg` into a standalone buffer, ready to be published.
pub fn to_bytes<'a, T: Serialize<'a>>(msg: &'a T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(tail) = msg.serialize(&mut buf)? {
        buf.extend_from_slice(tail);
    }

    Ok(buf)
}
