/// The addressable fields of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    AutoInvokeEvery,
    Outputs,
    InputShape,
    OutputShape,
    LastRunTime,
    AllocatedArenaSize,
    ModelSize,
    LastError,
    Format,
    FormatVersion,
}

impl Register {
    /// Every register, in code order.
    pub const ALL: [Register; 10] = [
        Self::AutoInvokeEvery,
        Self::Outputs,
        Self::InputShape,
        Self::OutputShape,
        Self::LastRunTime,
        Self::AllocatedArenaSize,
        Self::ModelSize,
        Self::LastError,
        Self::Format,
        Self::FormatVersion,
    ];

    /// Returns the wire code of the register.
    pub fn code(&self) -> u16 {
        match self {
            Self::AutoInvokeEvery => 0x80,
            Self::Outputs => 0x101,
            Self::InputShape => 0x180,
            Self::OutputShape => 0x181,
            Self::LastRunTime => 0x182,
            Self::AllocatedArenaSize => 0x183,
            Self::ModelSize => 0x184,
            Self::LastError => 0x185,
            Self::Format => 0x186,
            Self::FormatVersion => 0x187,
        }
    }

    /// Looks up a register by its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|reg| reg.code() == code)
    }

    /// Only the cadence can be written remotely.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::AutoInvokeEvery)
    }
}

/// An unsolicited register value pushed to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub register: Register,
    pub value: Vec<u8>,
}

pub fn encode_u16(v: u16) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn encode_u32(v: u32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn encode_u16s(vs: &[u16]) -> Vec<u8> {
    vs.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Packs floats as little-endian 32-bit values.
pub fn encode_f32s(vs: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice(vs).to_vec()
    } else {
        vs.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Reads a little-endian `u16` register value.
pub fn decode_u16(value: &[u8]) -> Option<u16> {
    let (bytes, _) = value.split_first_chunk::<2>()?;
    Some(u16::from_le_bytes(*bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for reg in Register::ALL {
            assert_eq!(Register::from_code(reg.code()), Some(reg));
        }
        assert_eq!(Register::from_code(0x81), None);
    }

    #[test]
    fn test_only_cadence_is_writable() {
        let writable: Vec<_> = Register::ALL.into_iter().filter(Register::is_writable).collect();
        assert_eq!(writable, vec![Register::AutoInvokeEvery]);
    }

    #[test]
    fn test_encoding() {
        assert_eq!(encode_u16s(&[1, 0x0203]), vec![1, 0, 3, 2]);
        assert_eq!(encode_f32s(&[1.0]), 1.0f32.to_le_bytes().to_vec());
        assert_eq!(decode_u16(&[0x32, 0x00, 0xff]), Some(50));
        assert_eq!(decode_u16(&[1]), None);
    }
}
