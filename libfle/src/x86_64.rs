//! x86-64 relocation arithmetic and PLT stub encoding, shared by the static
//! linker and the runtime relocation pass.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle::RelocKind;
use anyhow::bail;

pub(crate) const PLT_STUB_SIZE: u64 = 6;
pub(crate) const GOT_SLOT_SIZE: u64 = 8;

/// A computed relocation value, ready to be written at the patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchValue {
    Word32(u32),
    Word64(u64),
}

impl PatchValue {
    pub(crate) fn to_bytes(self) -> ([u8; 8], usize) {
        let mut bytes = [0; 8];
        match self {
            PatchValue::Word32(v) => {
                bytes[..4].copy_from_slice(&v.to_le_bytes());
                (bytes, 4)
            }
            PatchValue::Word64(v) => {
                bytes.copy_from_slice(&v.to_le_bytes());
                (bytes, 8)
            }
        }
    }
}

/// Computes the value a relocation writes, with S = resolved target address,
/// A = addend and P = virtual address of the patch site. PC-relative results
/// are the low 32 bits of the signed 64-bit arithmetic (wrap on overflow);
/// ABS32S additionally requires the result to fit a signed 32-bit value.
pub(crate) fn relocation_value(
    kind: RelocKind,
    s: u64,
    a: i64,
    p: u64,
    symbol: &str,
) -> Result<PatchValue> {
    let value = match kind {
        RelocKind::Abs64 => return Ok(PatchValue::Word64(s.wrapping_add_signed(a))),
        RelocKind::Abs32 => s.wrapping_add_signed(a) as u32,
        RelocKind::Abs32S => {
            let wide = (s as i64).wrapping_add(a);
            if i32::try_from(wide).is_err() {
                bail!(LinkError::BadRelocation(format!(
                    "value {wide:#x} for {symbol} does not fit a signed 32-bit field"
                )));
            }
            wide as u32
        }
        RelocKind::Pc32 | RelocKind::GotPcRel => {
            (s as i64).wrapping_add(a).wrapping_sub(p as i64) as u32
        }
    };
    Ok(PatchValue::Word32(value))
}

/// Encodes one PLT entry: `jmp *disp32(%rip)`, two opcode bytes followed by
/// the little-endian displacement.
pub(crate) fn generate_plt_stub(disp32: i32) -> [u8; 6] {
    let mut stub = [0xff, 0x25, 0, 0, 0, 0];
    stub[2..].copy_from_slice(&disp32.to_le_bytes());
    stub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plt_stub_encoding() {
        let stub = generate_plt_stub(0x1000 - 6);
        assert_eq!(stub, [0xff, 0x25, 0xfa, 0x0f, 0x00, 0x00]);
        let stub = generate_plt_stub(-6);
        assert_eq!(stub, [0xff, 0x25, 0xfa, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_pc32_is_signed_difference() {
        // A call site at 0x401000 patching a target at 0x400000 with the
        // usual -4 addend.
        let v = relocation_value(RelocKind::Pc32, 0x400000, -4, 0x401000, "f").unwrap();
        assert_eq!(v, PatchValue::Word32((-0x1004i32) as u32));
    }

    #[test]
    fn test_abs64() {
        let v = relocation_value(RelocKind::Abs64, 0x404000, 8, 0, "d").unwrap();
        assert_eq!(v, PatchValue::Word64(0x404008));
    }

    #[test]
    fn test_abs32s_range_check() {
        assert!(relocation_value(RelocKind::Abs32S, 0x7fff_ffff, 0, 0, "d").is_ok());
        assert!(relocation_value(RelocKind::Abs32S, 0x8000_0000, 0, 0, "d").is_err());
        assert!(relocation_value(RelocKind::Abs32S, 0, -1, 0, "d").is_ok());
    }

    #[test]
    fn test_abs32_truncates() {
        let v = relocation_value(RelocKind::Abs32, 0x1_0000_0001, 0, 0, "d").unwrap();
        assert_eq!(v, PatchValue::Word32(1));
    }

    #[test]
    fn test_patch_value_bytes() {
        let (bytes, len) = PatchValue::Word32(0x0403_0201).to_bytes();
        assert_eq!(&bytes[..len], &[1, 2, 3, 4]);
        let (bytes, len) = PatchValue::Word64(0x0807_0605_0403_0201).to_bytes();
        assert_eq!(&bytes[..len], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
