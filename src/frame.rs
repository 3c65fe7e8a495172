//! Wire formats exchanged with TCP clients.
//!
//! Two framed byte streams cross the gateway's TCP port:
//!
//! **Broadcast frame** (gateway → clients), built once per cycle from every
//! dirty block:
//!
//! | Field | Size | Description |
//! |-------|------|-------------|
//! | TotalLength | 4 bytes | Length of the whole frame, prefix included |
//! | ChunkLength | 2 bytes | `4 + payload length` |
//! | BlockId | 2 bytes | Block number |
//! | Payload | variable | Raw block snapshot |
//!
//! The chunk fields repeat once per block.
//!
//! **Write-back stream** (clients → gateway):
//!
//! | Field | Size | Description |
//! |-------|------|-------------|
//! | TotalLength | 4 bytes | Length of the whole frame, prefix included |
//! | BlockId | 2 bytes | Target block number |
//! | BitOffset | 4 bytes | Bit address inside the block |
//! | BitWidth | 1 byte | 1 for booleans, else 8, 16 or 32 |
//! | Value | 1 or `BitWidth / 8` bytes | Controller-order value bytes |
//!
//! Header integers are little-endian. Value bytes are already in controller
//! (big-endian) order; a boolean value byte carries the bit at `BitOffset % 8`.
//!
//! # Example
//!
//! ```
//! use plc_gateway::{decode_broadcast, BroadcastFrame};
//!
//! let mut frame = BroadcastFrame::new();
//! frame.push_chunk(1, &[0xAA]).unwrap();
//! let bytes = frame.finish().unwrap();
//!
//! let chunks = decode_broadcast(&bytes).unwrap();
//! assert_eq!(chunks[0].block, 1);
//! assert_eq!(chunks[0].payload, vec![0xAA]);
//! ```

use crate::error::{GatewayError, Result};
use crate::utils::{get_bit, split_bit_offset};
use crate::value::Value;

/// Size of the `TotalLength` prefix.
pub const TOTAL_LENGTH_SIZE: usize = 4;

/// Size of a broadcast chunk header (`ChunkLength` + `BlockId`).
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Size of a write command header (`BlockId` + `BitOffset` + `BitWidth`).
pub const COMMAND_HEADER_SIZE: usize = 7;

/// Largest block payload a single broadcast chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = u16::MAX as usize - CHUNK_HEADER_SIZE;

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Reads and checks the `TotalLength` prefix of a frame.
fn frame_length(buf: &[u8]) -> Result<usize> {
    if buf.len() < TOTAL_LENGTH_SIZE {
        return Err(GatewayError::protocol(format!(
            "frame too short: expected at least {} bytes, got {}",
            TOTAL_LENGTH_SIZE,
            buf.len()
        )));
    }
    let total = read_u32(buf, 0) as usize;
    if total < TOTAL_LENGTH_SIZE {
        return Err(GatewayError::protocol(format!(
            "total length {} is shorter than its own prefix",
            total
        )));
    }
    if total > buf.len() {
        return Err(GatewayError::protocol(format!(
            "total length {} exceeds the {} bytes received",
            total,
            buf.len()
        )));
    }
    Ok(total)
}

/// Accumulates dirty block snapshots into one broadcast frame.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    buf: Vec<u8>,
    chunks: usize,
}

impl BroadcastFrame {
    /// Creates an empty frame.
    pub fn new() -> Self {
        Self {
            buf: vec![0; TOTAL_LENGTH_SIZE],
            chunks: 0,
        }
    }

    /// Appends one block snapshot.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the payload is larger than
    /// [`MAX_CHUNK_PAYLOAD`].
    pub fn push_chunk(&mut self, block: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CHUNK_PAYLOAD {
            return Err(GatewayError::invalid_parameter(
                "payload",
                format!(
                    "block {} has {} bytes, max per chunk is {}",
                    block,
                    payload.len(),
                    MAX_CHUNK_PAYLOAD
                ),
            ));
        }
        let chunk_len = (CHUNK_HEADER_SIZE + payload.len()) as u16;
        self.buf.extend_from_slice(&chunk_len.to_le_bytes());
        self.buf.extend_from_slice(&block.to_le_bytes());
        self.buf.extend_from_slice(payload);
        self.chunks += 1;
        Ok(())
    }

    /// Returns the number of chunks appended so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Returns whether no chunk has been appended.
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    /// Writes the `TotalLength` prefix and returns the frame bytes, or
    /// `None` when there is nothing to send.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        if self.chunks == 0 {
            return None;
        }
        let total = self.buf.len() as u32;
        self.buf[..TOTAL_LENGTH_SIZE].copy_from_slice(&total.to_le_bytes());
        Some(self.buf)
    }
}

impl Default for BroadcastFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// One block snapshot decoded from a broadcast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastChunk {
    /// Block number.
    pub block: u16,
    /// Block bytes.
    pub payload: Vec<u8>,
}

/// Decodes a broadcast frame into its chunks.
///
/// This is the client-side view of what the acquisition loop sends.
///
/// # Errors
///
/// Returns `GatewayError::Protocol` if the frame or any chunk is truncated or
/// declares an impossible length.
pub fn decode_broadcast(frame: &[u8]) -> Result<Vec<BroadcastChunk>> {
    let total = frame_length(frame)?;
    let mut chunks = Vec::new();
    let mut pos = TOTAL_LENGTH_SIZE;

    while pos < total {
        if pos + CHUNK_HEADER_SIZE > total {
            return Err(GatewayError::protocol(format!(
                "chunk header at byte {} crosses frame end {}",
                pos, total
            )));
        }
        let chunk_len = read_u16(frame, pos) as usize;
        if chunk_len < CHUNK_HEADER_SIZE || pos + chunk_len > total {
            return Err(GatewayError::protocol(format!(
                "chunk at byte {} declares invalid length {}",
                pos, chunk_len
            )));
        }
        let block = read_u16(frame, pos + 2);
        let payload = frame[pos + CHUNK_HEADER_SIZE..pos + chunk_len].to_vec();
        chunks.push(BroadcastChunk { block, payload });
        pos += chunk_len;
    }

    Ok(chunks)
}

/// A single write-back instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    block: u16,
    bit_offset: u32,
    bit_width: u8,
    value: Vec<u8>,
}

impl WriteCommand {
    /// Returns the number of value bytes that follow a command header of the
    /// given bit width, or `None` for an unsupported width.
    pub fn payload_len(bit_width: u8) -> Option<usize> {
        match bit_width {
            1 => Some(1),
            8 | 16 | 32 => Some(bit_width as usize / 8),
            _ => None,
        }
    }

    /// Creates a command from raw parts.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the bit width is not
    /// 1, 8, 16 or 32, or if `value` has the wrong number of bytes for it.
    ///
    /// # Example
    ///
    /// ```
    /// use plc_gateway::WriteCommand;
    ///
    /// let cmd = WriteCommand::new(5, 10, 1, vec![0x04]).unwrap();
    /// assert_eq!(cmd.byte_offset(), 1);
    /// assert_eq!(cmd.bit_index(), 2);
    /// assert_eq!(cmd.bit_value(), Some(true));
    ///
    /// assert!(WriteCommand::new(5, 0, 12, vec![0, 0]).is_err());
    /// ```
    pub fn new(block: u16, bit_offset: u32, bit_width: u8, value: Vec<u8>) -> Result<Self> {
        let expected = Self::payload_len(bit_width).ok_or_else(|| {
            GatewayError::invalid_parameter("bit_width", format!("unsupported width {}", bit_width))
        })?;
        if value.len() != expected {
            return Err(GatewayError::invalid_parameter(
                "value",
                format!(
                    "width {} needs {} bytes, got {}",
                    bit_width,
                    expected,
                    value.len()
                ),
            ));
        }
        Ok(Self {
            block,
            bit_offset,
            bit_width,
            value,
        })
    }

    /// Creates the command that writes `value` at `bit_offset` in `block`.
    pub fn from_value(block: u16, bit_offset: u32, value: &Value) -> Self {
        Self {
            block,
            bit_offset,
            bit_width: value.kind().bit_width(),
            value: value.encode(bit_offset),
        }
    }

    /// Returns the target block number.
    pub fn block(&self) -> u16 {
        self.block
    }

    /// Returns the bit address inside the block.
    pub fn bit_offset(&self) -> u32 {
        self.bit_offset
    }

    /// Returns the bit width.
    pub fn bit_width(&self) -> u8 {
        self.bit_width
    }

    /// Returns the raw value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Returns the byte offset of the target inside the block.
    pub fn byte_offset(&self) -> usize {
        split_bit_offset(self.bit_offset).0
    }

    /// Returns the bit index of the target inside its byte.
    pub fn bit_index(&self) -> u8 {
        split_bit_offset(self.bit_offset).1
    }

    /// Returns whether this command writes a single bit.
    pub fn is_bit(&self) -> bool {
        self.bit_width == 1
    }

    /// For a bit command, returns the bit extracted from the value byte.
    pub fn bit_value(&self) -> Option<bool> {
        if self.is_bit() {
            Some(get_bit(self.value[0], self.bit_index()))
        } else {
            None
        }
    }

    /// Returns the encoded size of this command.
    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_SIZE + self.value.len()
    }

    /// Appends the encoded command (without frame prefix) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block.to_le_bytes());
        out.extend_from_slice(&self.bit_offset.to_le_bytes());
        out.push(self.bit_width);
        out.extend_from_slice(&self.value);
    }
}

/// Encodes commands into one write-back frame with its `TotalLength` prefix.
///
/// # Example
///
/// ```
/// use plc_gateway::{encode_commands, CommandReader, WriteCommand};
///
/// let cmd = WriteCommand::new(5, 10, 1, vec![0x04]).unwrap();
/// let frame = encode_commands(std::slice::from_ref(&cmd));
/// assert_eq!(frame.len(), 4 + 7 + 1);
///
/// let decoded: Vec<_> = CommandReader::new(&frame).unwrap().collect::<Result<_, _>>().unwrap();
/// assert_eq!(decoded, vec![cmd]);
/// ```
pub fn encode_commands(commands: &[WriteCommand]) -> Vec<u8> {
    let total: usize = TOTAL_LENGTH_SIZE + commands.iter().map(|c| c.encoded_len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    for command in commands {
        command.encode_into(&mut out);
    }
    out
}

/// Iterates over the commands of one write-back frame.
///
/// Every read is bounds-checked against the frame's `TotalLength`. The first
/// malformed command yields an error and ends the iteration; the bytes after
/// it are never interpreted.
#[derive(Debug)]
pub struct CommandReader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> CommandReader<'a> {
    /// Starts reading the frame at the beginning of `buf`.
    ///
    /// `buf` may hold more bytes after the frame; see [`frame_len`](Self::frame_len).
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Protocol` if the `TotalLength` prefix is missing,
    /// smaller than itself, or larger than `buf`.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let end = frame_length(buf)?;
        Ok(Self {
            buf,
            pos: TOTAL_LENGTH_SIZE,
            end,
        })
    }

    /// Returns the length of this frame, prefix included.
    pub fn frame_len(&self) -> usize {
        self.end
    }

    fn read_command(&mut self) -> Result<WriteCommand> {
        let at = self.pos;
        if at + COMMAND_HEADER_SIZE > self.end {
            return Err(GatewayError::protocol(format!(
                "command header at byte {} crosses frame end {}",
                at, self.end
            )));
        }
        let block = read_u16(self.buf, at);
        let bit_offset = read_u32(self.buf, at + 2);
        let bit_width = self.buf[at + 6];
        let value_len = WriteCommand::payload_len(bit_width).ok_or_else(|| {
            GatewayError::protocol(format!(
                "command at byte {} has unsupported bit width {}",
                at, bit_width
            ))
        })?;
        let value_start = at + COMMAND_HEADER_SIZE;
        let value_end = value_start + value_len;
        if value_end > self.end {
            return Err(GatewayError::protocol(format!(
                "command at byte {} needs {} value bytes, frame ends at {}",
                at, value_len, self.end
            )));
        }
        self.pos = value_end;
        Ok(WriteCommand {
            block,
            bit_offset,
            bit_width,
            value: self.buf[value_start..value_end].to_vec(),
        })
    }
}

impl Iterator for CommandReader<'_> {
    type Item = Result<WriteCommand>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let result = self.read_command();
        if result.is_err() {
            self.pos = self.end;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_two_blocks() {
        let mut frame = BroadcastFrame::new();
        frame.push_chunk(1, &[0xAA]).unwrap();
        frame.push_chunk(2, &[0x01, 0x02]).unwrap();
        assert_eq!(frame.chunk_count(), 2);
        let bytes = frame.finish().unwrap();

        assert_eq!(read_u32(&bytes, 0) as usize, bytes.len());
        assert_eq!(
            bytes,
            hex::decode(concat!("0f000000", "0500", "0100", "aa", "0600", "0200", "0102")).unwrap()
        );

        let chunks = decode_broadcast(&bytes).unwrap();
        assert_eq!(
            chunks,
            vec![
                BroadcastChunk {
                    block: 1,
                    payload: vec![0xAA]
                },
                BroadcastChunk {
                    block: 2,
                    payload: vec![0x01, 0x02]
                },
            ]
        );
    }

    #[test]
    fn test_empty_frame_finishes_to_none() {
        assert!(BroadcastFrame::new().finish().is_none());
    }

    #[test]
    fn test_chunk_too_large() {
        let mut frame = BroadcastFrame::new();
        let payload = vec![0u8; MAX_CHUNK_PAYLOAD + 1];
        assert!(frame.push_chunk(1, &payload).is_err());
        assert!(frame.is_empty());
    }

    #[test]
    fn test_decode_broadcast_truncated_chunk() {
        // chunk claims 8 bytes but frame holds 6
        let bytes = hex::decode("0a0000000800010000aa").unwrap();
        assert!(decode_broadcast(&bytes).is_err());
    }

    #[test]
    fn test_decode_broadcast_rejects_short_chunk_length() {
        let bytes = hex::decode("0800000002000100").unwrap();
        assert!(decode_broadcast(&bytes).is_err());
    }

    #[test]
    fn test_write_command_bit() {
        // block 5, bit offset 10, width 1, value 0x04
        let bytes = hex::decode(concat!("0c000000", "0500", "0a000000", "01", "04")).unwrap();
        let mut reader = CommandReader::new(&bytes).unwrap();
        let cmd = reader.next().unwrap().unwrap();
        assert!(reader.next().is_none());

        assert_eq!(cmd.block(), 5);
        assert_eq!(cmd.byte_offset(), 1);
        assert_eq!(cmd.bit_index(), 2);
        assert_eq!(cmd.bit_value(), Some(true));
    }

    #[test]
    fn test_write_command_bit_cleared() {
        let cmd = WriteCommand::new(5, 10, 1, vec![0xFB]).unwrap();
        assert_eq!(cmd.bit_value(), Some(false));
    }

    #[test]
    fn test_reader_multiple_commands_in_order() {
        let commands = vec![
            WriteCommand::from_value(1, 16, &Value::Int16(-2)),
            WriteCommand::from_value(2, 3, &Value::Bool(true)),
            WriteCommand::from_value(1, 32, &Value::Float32(2.5)),
            WriteCommand::new(3, 8, 8, vec![0x7F]).unwrap(),
        ];
        let frame = encode_commands(&commands);
        let decoded: Vec<_> = CommandReader::new(&frame)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_reader_stops_at_truncated_command() {
        let good = WriteCommand::from_value(1, 0, &Value::Int16(1));
        let mut frame = encode_commands(std::slice::from_ref(&good));
        // half a command header, covered by a bumped total length
        frame.extend_from_slice(&[0x01, 0x00, 0x00]);
        let total = frame.len() as u32;
        frame[..4].copy_from_slice(&total.to_le_bytes());

        let results: Vec<_> = CommandReader::new(&frame).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &good);
        assert!(matches!(results[1], Err(GatewayError::Protocol { .. })));
    }

    #[test]
    fn test_reader_value_crossing_frame_end() {
        // int32 command with only two value bytes inside the frame
        let bytes = hex::decode(concat!("0d000000", "0100", "00000000", "20", "0000")).unwrap();
        let results: Vec<_> = CommandReader::new(&bytes).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_reader_unsupported_width() {
        let bytes = hex::decode(concat!("0c000000", "0100", "00000000", "0c", "00")).unwrap();
        let mut reader = CommandReader::new(&bytes).unwrap();
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_reader_bad_total_length() {
        assert!(CommandReader::new(&[0x01, 0x00]).is_err());
        assert!(CommandReader::new(&hex::decode("02000000").unwrap()).is_err());
        assert!(CommandReader::new(&hex::decode("ff000000").unwrap()).is_err());
    }

    #[test]
    fn test_reader_empty_frame() {
        let frame = encode_commands(&[]);
        let mut reader = CommandReader::new(&frame).unwrap();
        assert_eq!(reader.frame_len(), 4);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_reader_leaves_trailing_frame() {
        let first = encode_commands(&[WriteCommand::from_value(1, 0, &Value::Bool(true))]);
        let second = encode_commands(&[WriteCommand::from_value(2, 0, &Value::Bool(true))]);
        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let reader = CommandReader::new(&buf).unwrap();
        assert_eq!(reader.frame_len(), first.len());
        assert_eq!(reader.count(), 1);
    }

    #[test]
    fn test_new_rejects_wrong_value_length() {
        assert!(WriteCommand::new(1, 0, 16, vec![0]).is_err());
        assert!(WriteCommand::new(1, 0, 1, vec![0, 0]).is_err());
        assert!(WriteCommand::new(1, 0, 32, vec![0; 4]).is_ok());
    }
}
