// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Binary framing of the part-exchange protocol: little-endian integers,
//! single-byte booleans, varint-length-prefixed strings, raw 16-byte hashes.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use twox_hash::xxhash3_128::Hasher;

use crate::common::types::UniqueId;
use crate::exchange::error::ExchangeError;

/// Strings from an untrusted peer are capped; a larger prefix means a
/// corrupt or malicious stream.
const MAX_STRING_SIZE: u64 = 16 * 1024 * 1024;

const COPY_CHUNK_SIZE: usize = 64 * 1024;

pub fn write_u64(out: &mut impl Write, value: u64) -> Result<(), ExchangeError> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64(input: &mut impl Read) -> Result<u64, ExchangeError> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_bool(out: &mut impl Write, value: bool) -> Result<(), ExchangeError> {
    out.write_all(&[u8::from(value)])?;
    Ok(())
}

pub fn read_bool(input: &mut impl Read) -> Result<bool, ExchangeError> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

pub fn write_u8(out: &mut impl Write, value: u8) -> Result<(), ExchangeError> {
    out.write_all(&[value])?;
    Ok(())
}

pub fn read_u8(input: &mut impl Read) -> Result<u8, ExchangeError> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_varuint(out: &mut impl Write, mut value: u64) -> Result<(), ExchangeError> {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.write_all(&[byte])?;
        if value == 0 {
            return Ok(());
        }
    }
}

pub fn read_varuint(input: &mut impl Read) -> Result<u64, ExchangeError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let mut buf = [0u8; 1];
        input.read_exact(&mut buf)?;
        value |= u64::from(buf[0] & 0x7F) << shift;
        if buf[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ExchangeError::Corrupted("varint is too long".to_string()))
}

pub fn write_string(out: &mut impl Write, value: &str) -> Result<(), ExchangeError> {
    write_varuint(out, value.len() as u64)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

pub fn write_bytes(out: &mut impl Write, value: &[u8]) -> Result<(), ExchangeError> {
    write_varuint(out, value.len() as u64)?;
    out.write_all(value)?;
    Ok(())
}

pub fn read_string(input: &mut impl Read) -> Result<String, ExchangeError> {
    let bytes = read_bytes(input)?;
    String::from_utf8(bytes)
        .map_err(|e| ExchangeError::Corrupted(format!("string is not valid utf-8: {}", e)))
}

pub fn read_bytes(input: &mut impl Read) -> Result<Vec<u8>, ExchangeError> {
    let len = read_varuint(input)?;
    if len > MAX_STRING_SIZE {
        return Err(ExchangeError::Corrupted(format!(
            "string of {} bytes exceeds the limit",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_u128(out: &mut impl Write, value: u128) -> Result<(), ExchangeError> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u128(input: &mut impl Read) -> Result<u128, ExchangeError> {
    let mut buf = [0u8; 16];
    input.read_exact(&mut buf)?;
    Ok(u128::from_le_bytes(buf))
}

/// Uuids travel as 36 characters of text, not binary.
pub fn write_uuid_text(out: &mut impl Write, uuid: UniqueId) -> Result<(), ExchangeError> {
    out.write_all(uuid.to_uuid_string().as_bytes())?;
    Ok(())
}

pub fn read_uuid_text(input: &mut impl Read) -> Result<UniqueId, ExchangeError> {
    let mut buf = [0u8; 36];
    input.read_exact(&mut buf)?;
    let text = std::str::from_utf8(&buf)
        .map_err(|e| ExchangeError::Corrupted(format!("uuid is not valid utf-8: {}", e)))?;
    text.parse()
        .map_err(|e: String| ExchangeError::Corrupted(e))
}

pub fn assert_eof(input: &mut impl Read) -> Result<(), ExchangeError> {
    let mut buf = [0u8; 1];
    match input.read(&mut buf)? {
        0 => Ok(()),
        _ => Err(ExchangeError::Corrupted(
            "unexpected data after the end of stream".to_string(),
        )),
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u128 {
    let mut hasher = Hasher::with_seed(0);
    hasher.write(bytes);
    hasher.finish_128()
}

/// Writer that forwards bytes and keeps a running 128-bit hash and count.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::with_seed(0),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn hash(&self) -> u128 {
        self.hasher.finish_128()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.write(&buf[..written]);
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Cancellation token shared between a transfer and its controller.
///
/// Copy loops poll it between chunks; the loop that notices the flag
/// removes its partial state and fails with `Aborted`.
#[derive(Clone, Default)]
pub struct ActionBlocker {
    cancelled: Arc<AtomicBool>,
}

impl ActionBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Byte-rate limiter shared by concurrent sends.
pub struct Throttler {
    max_bytes_per_sec: u64,
    state: Mutex<ThrottlerState>,
}

struct ThrottlerState {
    window_start: Instant,
    bytes_in_window: u64,
}

impl Throttler {
    pub fn new(max_bytes_per_sec: u64) -> Self {
        Self {
            max_bytes_per_sec,
            state: Mutex::new(ThrottlerState {
                window_start: Instant::now(),
                bytes_in_window: 0,
            }),
        }
    }

    pub fn add(&self, bytes: u64) {
        if self.max_bytes_per_sec == 0 {
            return;
        }
        let mut state = self.state.lock().expect("throttler lock");
        let elapsed = state.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            state.window_start = Instant::now();
            state.bytes_in_window = 0;
        }
        state.bytes_in_window += bytes;
        if state.bytes_in_window > self.max_bytes_per_sec {
            let excess = state.bytes_in_window - self.max_bytes_per_sec;
            let sleep = Duration::from_secs_f64(excess as f64 / self.max_bytes_per_sec as f64);
            drop(state);
            std::thread::sleep(sleep);
        }
    }
}

/// Copy up to `limit` bytes (or to EOF) in chunks, polling the blocker
/// between chunks and feeding the throttler.
pub fn copy_with_throttler(
    input: &mut impl Read,
    out: &mut impl Write,
    limit: Option<u64>,
    blocker: &ActionBlocker,
    throttler: Option<&Throttler>,
) -> Result<u64, ExchangeError> {
    let mut remaining = limit;
    let mut copied = 0u64;
    let mut buf = [0u8; COPY_CHUNK_SIZE];
    loop {
        if blocker.is_cancelled() {
            return Err(ExchangeError::Aborted);
        }
        let want = match remaining {
            Some(0) => break,
            Some(n) => (n as usize).min(COPY_CHUNK_SIZE),
            None => COPY_CHUNK_SIZE,
        };
        let read = input.read(&mut buf[..want])?;
        if read == 0 {
            if let Some(n) = remaining {
                if n > 0 {
                    return Err(ExchangeError::Corrupted(format!(
                        "stream ended {} bytes short",
                        n
                    )));
                }
            }
            break;
        }
        out.write_all(&buf[..read])?;
        copied += read as u64;
        if let Some(n) = remaining.as_mut() {
            *n -= read as u64;
        }
        if let Some(throttler) = throttler {
            throttler.add(read as u64);
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::{
        ActionBlocker, HashingWriter, copy_with_throttler, hash_bytes, read_string, read_u64,
        read_varuint, write_string, write_u64, write_varuint,
    };
    use crate::exchange::error::ExchangeError;
    use std::io::{Cursor, Write};

    #[test]
    fn varuint_round_trips_at_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_varuint(&mut buf, value).expect("write");
            let decoded = read_varuint(&mut Cursor::new(&buf)).expect("read");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn string_round_trips_with_length_prefix() {
        let mut buf = Vec::new();
        write_string(&mut buf, "checksums.txt").expect("write");
        write_u64(&mut buf, 42).expect("write");
        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_string(&mut cursor).expect("read"), "checksums.txt");
        assert_eq!(read_u64(&mut cursor).expect("read"), 42);
    }

    #[test]
    fn oversized_string_prefix_is_rejected() {
        let mut buf = Vec::new();
        write_varuint(&mut buf, u64::MAX / 2).expect("write");
        let err = read_string(&mut Cursor::new(&buf)).expect_err("must fail");
        assert!(matches!(err, ExchangeError::Corrupted(_)));
    }

    #[test]
    fn hashing_writer_matches_one_shot_hash() {
        let mut out = Vec::new();
        let mut writer = HashingWriter::new(&mut out);
        writer.write_all(b"hello ").expect("write");
        writer.write_all(b"world").expect("write");
        assert_eq!(writer.count(), 11);
        assert_eq!(writer.hash(), hash_bytes(b"hello world"));
    }

    #[test]
    fn cancelled_blocker_aborts_copy() {
        let blocker = ActionBlocker::new();
        blocker.cancel();
        let mut input = Cursor::new(vec![0u8; 1024]);
        let mut out = Vec::new();
        let err = copy_with_throttler(&mut input, &mut out, None, &blocker, None)
            .expect_err("must abort");
        assert!(matches!(err, ExchangeError::Aborted));
        assert!(out.is_empty());
    }

    #[test]
    fn short_stream_with_limit_is_detected() {
        let blocker = ActionBlocker::new();
        let mut input = Cursor::new(vec![0u8; 10]);
        let mut out = Vec::new();
        let err = copy_with_throttler(&mut input, &mut out, Some(20), &blocker, None)
            .expect_err("must fail");
        assert!(matches!(err, ExchangeError::Corrupted(_)));
    }
}
