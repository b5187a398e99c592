//! Versioned binary format for samples and batches of samples.
//!
//! A sample is laid out as
//!
//! ```text
//! version: u16 BE | timestamp: zig-zag varint | value: f64 bits BE
//! | label count: u16 BE | label count x (len: u16 BE | utf-8 bytes)
//! ```
//!
//! and a batch is a `u16` big-endian sample count followed by that many
//! encoded samples. Strings everywhere use the same `u16` length prefix.

mod error;

pub use error::{DecodeError, EncodeError};

use std::{collections::BTreeMap, convert::TryFrom, str};

use bumpalo::collections::Vec as BumpVec;
use bytes::{Buf, BufMut};

use crate::{arena::Arena, sample::Sample};

pub const VERSION: u16 = 1;

pub const MAX_BATCH_SAMPLES: usize = u16::MAX as usize;

pub const BATCH_HEADER_LEN: usize = 2;

/// Sample decoded into an [`Arena`]. Valid until the arena is reset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleRef<'a> {
    pub labels: &'a [&'a str],
    pub timestamp: i64,
    pub value: f64,
}

impl SampleRef<'_> {
    pub fn to_sample(&self) -> Sample {
        Sample::new(self.labels.iter().copied(), self.timestamp, self.value)
    }

    pub fn label_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }
}

pub fn encode_sample(sample: &Sample, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    encode_sample_parts(&sample.labels, sample.timestamp, sample.value, buf)
}

/// Encodes a sample from its parts. The label list is validated before
/// anything is written, so a failed call leaves `buf` untouched.
pub fn encode_sample_parts<S>(
    labels: &[S],
    timestamp: i64,
    value: f64,
    buf: &mut impl BufMut,
) -> Result<(), EncodeError>
where
    S: AsRef<str>,
{
    let count =
        u16::try_from(labels.len()).map_err(|_| EncodeError::TooManyLabels(labels.len()))?;
    if let Some(label) = labels
        .iter()
        .map(AsRef::<str>::as_ref)
        .find(|label| label.len() > usize::from(u16::MAX))
    {
        return Err(EncodeError::StringTooLong(label.len()));
    }

    buf.put_u16(VERSION);
    put_varint(timestamp, buf);
    buf.put_u64(value.to_bits());
    buf.put_u16(count);
    for label in labels {
        put_string(label.as_ref(), buf)?;
    }
    Ok(())
}

pub fn encode_batch(samples: &[Sample], buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let count =
        u16::try_from(samples.len()).map_err(|_| EncodeError::TooManySamples(samples.len()))?;
    buf.put_u16(count);
    for sample in samples {
        encode_sample(sample, buf)?;
    }
    Ok(())
}

/// Reserves room for the sample count of a batch that is built incrementally.
pub fn put_batch_header(buf: &mut impl BufMut) {
    buf.put_u16(0);
}

/// Writes the final sample count into a batch started with [`put_batch_header`].
pub fn set_batch_count(batch: &mut [u8], count: usize) -> Result<(), EncodeError> {
    let count = u16::try_from(count).map_err(|_| EncodeError::TooManySamples(count))?;
    let batch_len = batch.len();
    let header = batch
        .get_mut(..BATCH_HEADER_LEN)
        .ok_or(EncodeError::MissingBatchHeader(batch_len))?;
    header.copy_from_slice(&count.to_be_bytes());
    Ok(())
}

/// Decodes one sample that spans the whole of `data`. The result owns its
/// strings.
pub fn decode_sample(mut data: &[u8]) -> Result<Sample, DecodeError> {
    let sample = read_owned_sample(&mut data)?;
    ensure_consumed(data)?;
    Ok(sample)
}

/// Decodes a batch into owned samples.
pub fn decode_batch(mut data: &[u8]) -> Result<Vec<Sample>, DecodeError> {
    let count = usize::from(take_u16(&mut data)?);
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(read_owned_sample(&mut data)?);
    }
    ensure_consumed(data)?;
    Ok(samples)
}

/// Decodes a batch into `arena`. Label strings are copied into the arena so
/// the result does not borrow from `data`.
pub fn decode_batch_in<'a>(
    mut data: &[u8],
    arena: &'a Arena,
) -> Result<BumpVec<'a, SampleRef<'a>>, DecodeError> {
    let count = usize::from(take_u16(&mut data)?);
    let mut samples = arena.vec(count);
    for _ in 0..count {
        let (timestamp, value, label_count) = read_sample_header(&mut data)?;
        let mut labels = arena.vec(label_count);
        for _ in 0..label_count {
            labels.push(arena.alloc_str(get_string(&mut data)?));
        }
        samples.push(SampleRef {
            labels: labels.into_bump_slice(),
            timestamp,
            value,
        });
    }
    ensure_consumed(data)?;
    Ok(samples)
}

pub fn put_string(value: &str, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let len = u16::try_from(value.len()).map_err(|_| EncodeError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Reads a length-prefixed string borrowed from the input.
pub fn get_string<'b>(buf: &mut &'b [u8]) -> Result<&'b str, DecodeError> {
    let len = usize::from(take_u16(buf)?);
    let bytes = take_bytes(buf, len)?;
    Ok(str::from_utf8(bytes)?)
}

/// Writes a `u16` entry count followed by length-prefixed keys and values.
pub fn put_map(map: &BTreeMap<String, String>, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    let count = u16::try_from(map.len()).map_err(|_| EncodeError::TooManyEntries(map.len()))?;
    buf.put_u16(count);
    for (key, value) in map {
        put_string(key, buf)?;
        put_string(value, buf)?;
    }
    Ok(())
}

pub fn get_map(buf: &mut &[u8]) -> Result<BTreeMap<String, String>, DecodeError> {
    let count = take_u16(buf)?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = get_string(buf)?.to_owned();
        let value = get_string(buf)?.to_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn read_owned_sample(buf: &mut &[u8]) -> Result<Sample, DecodeError> {
    let (timestamp, value, label_count) = read_sample_header(buf)?;
    let mut labels = Vec::with_capacity(label_count);
    for _ in 0..label_count {
        labels.push(get_string(buf)?.to_owned());
    }
    Ok(Sample {
        labels,
        timestamp,
        value,
    })
}

fn read_sample_header(buf: &mut &[u8]) -> Result<(i64, f64, usize), DecodeError> {
    let version = take_u16(buf)?;
    if version != VERSION {
        return Err(DecodeError::Version {
            found: version,
            expected: VERSION,
        });
    }
    let timestamp = take_varint(buf)?;
    ensure_remaining(buf, 8)?;
    let value = f64::from_bits(buf.get_u64());
    let label_count = usize::from(take_u16(buf)?);
    Ok((timestamp, value, label_count))
}

fn put_varint(value: i64, buf: &mut impl BufMut) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    while zigzag >= 0x80 {
        buf.put_u8((zigzag as u8) | 0x80);
        zigzag >>= 7;
    }
    buf.put_u8(zigzag as u8);
}

#[allow(clippy::cast_possible_wrap)]
fn take_varint(buf: &mut &[u8]) -> Result<i64, DecodeError> {
    let mut zigzag = 0_u64;
    let mut shift = 0;
    loop {
        ensure_remaining(buf, 1)?;
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        zigzag |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((zigzag >> 1) as i64 ^ -((zigzag & 1) as i64));
        }
        shift += 7;
    }
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, DecodeError> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_bytes<'b>(buf: &mut &'b [u8], len: usize) -> Result<&'b [u8], DecodeError> {
    ensure_remaining(buf, len)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn ensure_remaining(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

fn ensure_consumed(buf: &[u8]) -> Result<(), DecodeError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::TrailingBytes(buf.len()))
    }
}
