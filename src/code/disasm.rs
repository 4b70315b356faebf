//! Disassembly of generated code, for trace logging and tests

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, Mnemonic};

/// Size of the address literal that follows an absolute call
const LITERAL: usize = 8;

/// Whether `jmp` skips the literal of the absolute call `call` right before it
fn skips_literal(call: &Instruction, jmp: &Instruction) -> bool {
    call.mnemonic() == Mnemonic::Call
        && call.is_ip_rel_memory_operand()
        && call.ip_rel_memory_address() == jmp.next_ip()
        && jmp.mnemonic() == Mnemonic::Jmp
        && jmp.near_branch_target() == jmp.next_ip() + LITERAL as u64
}

/// Decodes `code` as if it were loaded at `ip`
///
/// Address literals of absolute calls are stepped over. Decoding stops at the first invalid instruction.
pub fn decode(code: &[u8], bitness: u32, ip: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(bitness, code, ip, DecoderOptions::NONE);
    let mut out: Vec<Instruction> = Vec::new();
    let mut instruction = Instruction::default();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            break;
        }
        out.push(instruction);

        let literal = match out.as_slice() {
            [.., call, jmp] => skips_literal(call, jmp),
            _ => false,
        };
        if literal {
            let next = decoder.position() + LITERAL;
            if decoder.set_position(next).is_err() {
                break;
            }
            decoder.set_ip(ip + next as u64);
        }
    }
    out
}

/// Formats `code` as one Intel-syntax line per instruction
pub fn listing_lines(code: &[u8], bitness: u32, ip: u64) -> Vec<String> {
    let mut formatter = IntelFormatter::new();
    decode(code, bitness, ip)
        .iter()
        .map(|instruction| {
            let mut line = String::new();
            formatter.format(instruction, &mut line);
            line
        })
        .collect()
}

/// Formats `code` as an address-prefixed listing
pub fn listing(code: &[u8], bitness: u32, ip: u64) -> String {
    listing_lines(code, bitness, ip)
        .into_iter()
        .zip(decode(code, bitness, ip))
        .map(|(line, instruction)| format!("{:016x}  {line}\n", instruction.ip()))
        .collect()
}
