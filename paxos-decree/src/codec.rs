//! JSON-lines wire format: one externally tagged message per line,
//! e.g. `{"Prepare":{"proposal_number":{"round":1,"identity":"p1"}}}`.

use std::io::{BufRead, Write};

use thiserror::Error;

use crate::paxos::messages::PaxosMessage;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode(msg: &PaxosMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode(line: &str) -> Result<PaxosMessage, CodecError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write `msg` followed by a newline.
pub fn write_message<W: Write>(writer: &mut W, msg: &PaxosMessage) -> Result<(), CodecError> {
    let json = encode(msg)?;
    writer.write_all(json.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read the next message, or `None` at end of stream. Blank lines are skipped.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<PaxosMessage>, CodecError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return decode(&line).map(Some);
        }
    }
}
