//! Frame encoding for the TCP-backed transport (§6.1): fixed-header,
//! length-prefixed frames carrying the one-sided write/read/completion
//! protocol and the MR-exchange two-sided send. Every header is a
//! `bytemuck` POD struct, native-endian, matching §6's literal byte
//! ordering requirement.

use std::io::{self, Read, Write};

use bytemuck::{Pod, Zeroable};

/// Reserved immediate-data value meaning "this receive carried a memory
/// region descriptor," per §4.3 "Immediate-data reservations."
pub const SP_REMOTE_MR_RECV: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    MrExchange = 1,
    Write = 2,
    Read = 3,
    ReadReply = 4,
    Completion = 5,
}

impl Opcode {
    fn from_u8(b: u8) -> io::Result<Self> {
        match b {
            1 => Ok(Opcode::MrExchange),
            2 => Ok(Opcode::Write),
            3 => Ok(Opcode::Read),
            4 => Ok(Opcode::ReadReply),
            5 => Ok(Opcode::Completion),
            other => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown opcode {other}"))),
        }
    }
}

/// The 40-byte memory-region-descriptor record exchanged at connection
/// setup (§6), carried as the payload of the first `MrExchange` send.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MrRecord {
    pub base_addr: u64,
    pub rkey: u32,
    pub _pad: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<MrRecord>() == 40);

/// Two-sided send header: `len` bytes follow from the sender's send region,
/// `immediate` is either a node id (application traffic) or
/// [`SP_REMOTE_MR_RECV`].
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SendHeader {
    pub len: u32,
    pub immediate: u32,
}

/// One-sided write request: land `len` bytes at `remote_offset` in the
/// receiver's local region. `req_id` is echoed back in a `Completion`
/// frame; `imm`/`has_imm` optionally deliver an immediate alongside it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct WriteHeader {
    pub remote_offset: u64,
    pub len: u32,
    pub req_id: u32,
    pub has_imm: u32,
    pub imm: u32,
}

/// One-sided read request: fetch `len` bytes from `remote_offset` in the
/// receiver's local region. `task_id` is echoed back in the `ReadReply`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ReadHeader {
    pub remote_offset: u64,
    pub len: u32,
    pub task_id: u32,
}

/// Reply to a `Read` frame: `len` bytes of payload follow.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ReadReplyHeader {
    pub task_id: u32,
    pub len: u32,
    pub success: u32,
}

/// Acknowledgement of a `Write` frame.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CompletionHeader {
    pub req_id: u32,
    pub success: u32,
}

pub enum Frame {
    MrExchange { header: SendHeader, payload: Vec<u8> },
    Write { header: WriteHeader, payload: Vec<u8> },
    Read { header: ReadHeader },
    ReadReply { header: ReadReplyHeader, payload: Vec<u8> },
    Completion { header: CompletionHeader },
}

fn header_bytes<T: Pod>(header: &T) -> &[u8] {
    bytemuck::bytes_of(header)
}

fn read_exact_vec(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_pod<T: Pod + Zeroable>(r: &mut impl Read) -> io::Result<T> {
    let mut value = T::zeroed();
    r.read_exact(bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

impl Frame {
    /// Write `self` as `u32 frame_len` + `u8 opcode` + header + payload.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let (opcode, header_bytes, payload): (Opcode, Vec<u8>, &[u8]) = match self {
            Frame::MrExchange { header, payload } => (Opcode::MrExchange, header_bytes(header).to_vec(), payload),
            Frame::Write { header, payload } => (Opcode::Write, header_bytes(header).to_vec(), payload),
            Frame::Read { header } => (Opcode::Read, header_bytes(header).to_vec(), &[]),
            Frame::ReadReply { header, payload } => (Opcode::ReadReply, header_bytes(header).to_vec(), payload),
            Frame::Completion { header } => (Opcode::Completion, header_bytes(header).to_vec(), &[]),
        };
        let frame_len = (1 + header_bytes.len() + payload.len()) as u32;
        w.write_all(&frame_len.to_ne_bytes())?;
        w.write_all(&[opcode as u8])?;
        w.write_all(&header_bytes)?;
        w.write_all(payload)?;
        w.flush()
    }

    /// Read one frame off `r`, blocking until the whole frame has arrived.
    pub fn read_from(r: &mut impl Read) -> io::Result<Frame> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let frame_len = u32::from_ne_bytes(len_buf) as usize;
        let body = read_exact_vec(r, frame_len)?;
        let mut cursor = io::Cursor::new(body);
        let mut opcode_byte = [0u8; 1];
        cursor.read_exact(&mut opcode_byte)?;
        let opcode = Opcode::from_u8(opcode_byte[0])?;
        match opcode {
            Opcode::MrExchange => {
                let header: SendHeader = read_pod(&mut cursor)?;
                let payload = read_exact_vec(&mut cursor, header.len as usize)?;
                Ok(Frame::MrExchange { header, payload })
            }
            Opcode::Write => {
                let header: WriteHeader = read_pod(&mut cursor)?;
                let payload = read_exact_vec(&mut cursor, header.len as usize)?;
                Ok(Frame::Write { header, payload })
            }
            Opcode::Read => {
                let header: ReadHeader = read_pod(&mut cursor)?;
                Ok(Frame::Read { header })
            }
            Opcode::ReadReply => {
                let header: ReadReplyHeader = read_pod(&mut cursor)?;
                let payload = read_exact_vec(&mut cursor, header.len as usize)?;
                Ok(Frame::ReadReply { header, payload })
            }
            Opcode::Completion => {
                let header: CompletionHeader = read_pod(&mut cursor)?;
                Ok(Frame::Completion { header })
            }
        }
    }
}

/// Encode the MR descriptor as the 40-byte §6 record.
pub fn mr_record(base_addr: u64, rkey: u32) -> MrRecord {
    MrRecord {
        base_addr,
        rkey,
        _pad: [0u8; 28],
    }
}

pub fn decode_mr_record(bytes: &[u8]) -> io::Result<MrRecord> {
    if bytes.len() != std::mem::size_of::<MrRecord>() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed MR record"));
    }
    Ok(*bytemuck::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_frame_round_trips_through_a_cursor() {
        let mut buf = Vec::new();
        let frame = Frame::Write {
            header: WriteHeader {
                remote_offset: 128,
                len: 4,
                req_id: 7,
                has_imm: 0,
                imm: 0,
            },
            payload: vec![1, 2, 3, 4],
        };
        frame.write_to(&mut buf).unwrap();

        let mut cursor = io::Cursor::new(buf);
        match Frame::read_from(&mut cursor).unwrap() {
            Frame::Write { header, payload } => {
                assert_eq!(header.remote_offset, 128);
                assert_eq!(header.req_id, 7);
                assert_eq!(payload, vec![1, 2, 3, 4]);
            }
            _ => panic!("wrong frame variant"),
        }
    }

    #[test]
    fn mr_record_is_exactly_forty_bytes() {
        let rec = mr_record(0xdead_beef, 99);
        let bytes = bytemuck::bytes_of(&rec);
        assert_eq!(bytes.len(), 40);
        let decoded = decode_mr_record(bytes).unwrap();
        assert_eq!(decoded.base_addr, 0xdead_beef);
        assert_eq!(decoded.rkey, 99);
    }
}
