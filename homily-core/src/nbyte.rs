use std::str::FromStr;

/// 以二进制单位表示的字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize {
    pub(crate) quotient: u64,
    pub(crate) remainder: u64,
    pub(crate) unit: Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    B,
    KB,
    MB,
    GB,
    TB,
    PB,
}

impl Unit {
    const ALL: [Unit; 6] = [Unit::B, Unit::KB, Unit::MB, Unit::GB, Unit::TB, Unit::PB];

    const fn shift(self) -> u32 {
        match self {
            Unit::B => 0,
            Unit::KB => 10,
            Unit::MB => 20,
            Unit::GB => 30,
            Unit::TB => 40,
            Unit::PB => 50,
        }
    }

    /// 面向用户的单位名称
    pub fn label(self) -> &'static str {
        match self {
            Unit::B => "Bytes",
            Unit::KB => "KB",
            Unit::MB => "MB",
            Unit::GB => "GB",
            Unit::TB => "TB",
            Unit::PB => "PB",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "" | "B" | "BYTE" | "BYTES" => Some(Unit::B),
            "K" | "KB" | "KIB" => Some(Unit::KB),
            "M" | "MB" | "MIB" => Some(Unit::MB),
            "G" | "GB" | "GIB" => Some(Unit::GB),
            "T" | "TB" | "TIB" => Some(Unit::TB),
            "P" | "PB" | "PIB" => Some(Unit::PB),
            _ => None,
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl ByteSize {
    pub fn new(quotient: u64, remainder: u64, unit: Unit) -> Self {
        Self {
            quotient,
            remainder,
            unit,
        }
    }

    /// 选择使数值不小于 1 的最大单位
    pub fn from_bytes(bytes: u64) -> Self {
        let unit = Unit::ALL
            .into_iter()
            .rev()
            .find(|unit| bytes >= 1u64 << unit.shift())
            .unwrap_or(Unit::B);
        let shift = unit.shift();
        ByteSize::new(bytes >> shift, bytes & ((1u64 << shift) - 1), unit)
    }

    pub fn to_bytes(&self) -> u64 {
        (self.quotient << self.unit.shift()) | self.remainder
    }

    pub fn to_float(&self) -> f64 {
        let scale = (1u64 << self.unit.shift()) as f64;
        self.quotient as f64 + self.remainder as f64 / scale
    }
}

impl std::fmt::Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 保留两位小数并去掉末尾的 0
        let rounded = (self.to_float() * 100.0).round() / 100.0;
        write!(f, "{} {}", rounded, self.unit)
    }
}

/// 格式化字节数，如 `0 Bytes`、`1.5 KB`
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::from_bytes(bytes).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid size `{0}`, expected something like `500MB` or `1.5 GB`")]
pub struct ParseSizeError(String);

impl FromStr for ByteSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSizeError(s.to_string());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let value: f64 = number.parse().map_err(|_| err())?;
        let unit = Unit::parse(unit.trim()).ok_or_else(err)?;
        let bytes = value * (1u64 << unit.shift()) as f64;
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            return Err(err());
        }
        Ok(ByteSize::from_bytes(bytes.round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    const PB: u64 = 1 << 50;

    #[test]
    fn test_from_bytes() {
        // (bytes, quotient, remainder, unit)
        let cases: &[(u64, u64, u64, Unit)] = &[
            (0, 0, 0, Unit::B),
            (1023, 1023, 0, Unit::B),
            (KB, 1, 0, Unit::KB),
            (1536, 1, 512, Unit::KB),
            (MB - 1, 1023, 1023, Unit::KB),
            (3 * MB + 256, 3, 256, Unit::MB),
            (5 * GB + MB, 5, MB, Unit::GB),
            (100 * PB + 512, 100, 512, Unit::PB),
        ];
        for &(bytes, q, r, unit) in cases {
            let size = ByteSize::from_bytes(bytes);
            assert_eq!(size, ByteSize::new(q, r, unit), "from_bytes({bytes})");
            assert_eq!(size.to_bytes(), bytes);
        }
    }

    #[test]
    fn test_format_bytes() {
        let cases: &[(u64, &str)] = &[
            (0, "0 Bytes"),
            (1, "1 Bytes"),
            (1023, "1023 Bytes"),
            (1024, "1 KB"),
            (1536, "1.5 KB"),
            (1600, "1.56 KB"),
            (MB, "1 MB"),
            (MB - 1, "1024 KB"),
            (50 * MB, "50 MB"),
            (GB + GB / 4, "1.25 GB"),
        ];
        for &(bytes, expected) in cases {
            assert_eq!(format_bytes(bytes), expected, "format_bytes({bytes})");
        }
    }

    #[test]
    fn test_parse() {
        let cases: &[(&str, u64)] = &[
            ("1024", 1024),
            ("500MB", 500 * MB),
            ("1.5 GB", GB + GB / 2),
            ("2k", 2 * KB),
            ("3 GiB", 3 * GB),
        ];
        for &(input, bytes) in cases {
            assert_eq!(input.parse::<ByteSize>().map(|s| s.to_bytes()), Ok(bytes), "{input}");
        }
        assert!("".parse::<ByteSize>().is_err());
        assert!("12 parsecs".parse::<ByteSize>().is_err());
        assert!("-5MB".parse::<ByteSize>().is_err());
    }
}
