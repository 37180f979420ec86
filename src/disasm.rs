//! Minimal x86-64 instruction decoding: the engine only needs to know
//! whether the next instruction is a CALL and how long it is, to convert a
//! step into a resume-past-the-call.

use crate::error::{Error, Result};
use iced_x86::{Code, Decoder, DecoderOptions, FlowControl};

/// The longest legal x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Copy, Clone, Debug)]
pub struct DecodedInstruction {
    pub length: usize,
    pub is_call: bool,
}

/// Decode exactly one instruction from `bytes` as if it lived at `ip`.
pub fn decode_one(bytes: &[u8], ip: u64) -> Result<DecodedInstruction> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.code() == Code::INVALID {
        return Err(Error::decode(format!(
            "undecodable instruction at {:#x}",
            ip
        )));
    }
    Ok(DecodedInstruction {
        length: instruction.len(),
        is_call: matches!(
            instruction.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_near_call() {
        // call rel32
        let decoded = decode_one(&[0xe8, 0x00, 0x10, 0x00, 0x00], 0x1000).unwrap();
        assert!(decoded.is_call);
        assert_eq!(decoded.length, 5);
    }

    #[test]
    fn recognizes_indirect_call() {
        // call rax
        let decoded = decode_one(&[0xff, 0xd0], 0x1000).unwrap();
        assert!(decoded.is_call);
        assert_eq!(decoded.length, 2);
    }

    #[test]
    fn non_call_is_reported_with_length() {
        // mov rax, rdi
        let decoded = decode_one(&[0x48, 0x89, 0xf8], 0x1000).unwrap();
        assert!(!decoded.is_call);
        assert_eq!(decoded.length, 3);
    }
}
