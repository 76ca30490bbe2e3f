use crate::decode::prefix_length;

/// Checks whether `code` starts with an instruction that only ring 0 (or
/// a sufficient IOPL) may execute.
///
/// A general protection fault with a zero error code is raised both for
/// these and for ordinary protection violations; the dispatcher uses this
/// predicate to tell them apart.
pub fn is_privileged_instruction(code: &[u8]) -> bool {
    let code = &code[prefix_length(code)..];

    match code {
        // clts, invd, wbinvd, mov to/from control and debug registers.
        [0x0f, 0x06 | 0x08 | 0x09 | 0x20..=0x23, ..] => true,

        // ins, outs, in, out.
        [0x6c..=0x6f, ..] | [0xe4..=0xe7, ..] | [0xec..=0xef, ..] => true,

        // hlt, cli, sti.
        [0xf4 | 0xfa | 0xfb, ..] => true,

        _ => false,
    }
}

/// Checks whether `code` starts with an instruction that loads a segment
/// register from memory or a general register.
///
/// Such a load faults with the offending selector (or 0) as error code
/// whatever the bitness of the running code.
pub fn is_segment_load(code: &[u8]) -> bool {
    let code = &code[prefix_length(code)..];

    match code {
        // pop es, pop ss, pop ds, mov sreg, les, lds.
        [0x07 | 0x17 | 0x1f, ..] | [0x8e, ..] | [0xc4 | 0xc5, ..] => true,

        // pop fs, pop gs, lss, lfs, lgs.
        [0x0f, 0xa1 | 0xa9 | 0xb2 | 0xb4 | 0xb5, ..] => true,

        _ => false,
    }
}
