//! Request body decoders: fixed length and chunked transfer coding

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    /// Hex size digits, then optional extensions until CR
    Size { value: u64, digits: u8, in_ext: bool },
    SizeLf { value: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    /// Start of a trailer line or the final CRLF
    TrailerStart,
    TrailerLine,
    FinalLf,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length { remaining: u64 },
    Chunked(Chunk),
}

/// Streaming body decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDecoder(Kind);

impl BodyDecoder {
    pub fn length(n: u64) -> Self {
        BodyDecoder(Kind::Length { remaining: n })
    }

    pub fn chunked() -> Self {
        BodyDecoder(Kind::Chunked(Chunk::Size { value: 0, digits: 0, in_ext: false }))
    }

    /// Whole body consumed
    pub fn is_done(&self) -> bool {
        matches!(self.0, Kind::Length { remaining: 0 } | Kind::Chunked(Chunk::Done))
    }

    /// Decode from `input`, appending payload bytes to `out`
    ///
    /// Returns the number of input bytes consumed. Stops at the end of the
    /// body, leaving any following (pipelined) bytes untouched.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        match &mut self.0 {
            Kind::Length { remaining } => {
                let n = (*remaining).min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..n]);
                *remaining -= n as u64;
                Ok(n)
            }
            Kind::Chunked(state) => decode_chunked(state, input, out),
        }
    }
}

fn decode_chunked(state: &mut Chunk, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    let mut pos = 0;

    while pos < input.len() {
        if let Chunk::Data { remaining } = state {
            let n = (*remaining).min((input.len() - pos) as u64) as usize;
            out.extend_from_slice(&input[pos..pos + n]);
            pos += n;
            *remaining -= n as u64;
            if *remaining == 0 {
                *state = Chunk::DataCr;
            }
            continue;
        }

        let byte = input[pos];
        *state = match *state {
            Chunk::Done => return Ok(pos),
            Chunk::Size { value, digits, in_ext } => match byte {
                b'\r' if digits == 0 => return Err(ProtocolError::InvalidChunk),
                b'\r' => Chunk::SizeLf { value },
                _ if in_ext => Chunk::Size { value, digits, in_ext },
                b';' | b' ' | b'\t' if digits > 0 => Chunk::Size { value, digits, in_ext: true },
                _ => {
                    let digit = (byte as char).to_digit(16).ok_or(ProtocolError::InvalidChunk)?;
                    if digits == 16 {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    Chunk::Size { value: value << 4 | digit as u64, digits: digits + 1, in_ext }
                }
            },
            Chunk::SizeLf { value } => match byte {
                b'\n' if value == 0 => Chunk::TrailerStart,
                b'\n' => Chunk::Data { remaining: value },
                _ => return Err(ProtocolError::InvalidChunk),
            },
            Chunk::DataCr => match byte {
                b'\r' => Chunk::DataLf,
                _ => return Err(ProtocolError::InvalidChunk),
            },
            Chunk::DataLf => match byte {
                b'\n' => Chunk::Size { value: 0, digits: 0, in_ext: false },
                _ => return Err(ProtocolError::InvalidChunk),
            },
            Chunk::TrailerStart => match byte {
                b'\r' => Chunk::FinalLf,
                _ => Chunk::TrailerLine,
            },
            Chunk::TrailerLine => match byte {
                b'\n' => Chunk::TrailerStart,
                _ => Chunk::TrailerLine,
            },
            Chunk::FinalLf => match byte {
                b'\n' => Chunk::Done,
                _ => return Err(ProtocolError::InvalidChunk),
            },
            data @ Chunk::Data { .. } => data,
        };
        pos += 1;
    }

    Ok(pos)
}
