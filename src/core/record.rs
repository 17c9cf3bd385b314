// Fixed-width enrollment record layout, encoding, and decoding.
// All integers and floats are little-endian; fields are packed with no padding.
use std::fmt;

use serde::{Serialize, Serializer};

use crate::core::error::{Error, ErrorKind};

pub const NAME_LEN: usize = 64;
pub const RECORD_SIZE: usize = 95;
pub const NAME_FILL: u8 = b' ';

const IBGE_AT: usize = 0;
const YEAR_AT: usize = 4;
const SEX_AT: usize = 6;
const QUANTITY_AT: usize = 7;
const NAME_AT: usize = 15;
const LATITUDE_AT: usize = 79;
const LONGITUDE_AT: usize = 87;

const _: () = assert!(LONGITUDE_AT + 8 == RECORD_SIZE);
const _: () = assert!(NAME_AT + NAME_LEN == LATITUDE_AT);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Sex {
    Male,
    Female,
    Blank,
}

impl Sex {
    pub fn code(self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Blank => "",
        }
    }

    /// Parses a query filter: empty means "no filter", otherwise exactly `M` or `F`.
    pub fn parse_filter(value: &str) -> Result<Option<Sex>, Error> {
        match value.trim() {
            "" => Ok(None),
            "M" | "m" => Ok(Some(Sex::Male)),
            "F" | "f" => Ok(Some(Sex::Female)),
            other => Err(Error::new(ErrorKind::Validation)
                .with_message(format!("unsupported sex filter {other:?}"))
                .with_hint("Use M, F, or omit the filter.")),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Sex::Male => b'M',
            Sex::Female => b'F',
            Sex::Blank => b' ',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'M' => Some(Sex::Male),
            b'F' => Some(Sex::Female),
            b' ' => Some(Sex::Blank),
            _ => None,
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for Sex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// One enrollment observation for a municipality, year and sex.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    pub ibge: u32,
    pub year: u16,
    pub sex: Sex,
    pub quantity: f64,
    pub municipio: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Record {
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[IBGE_AT..IBGE_AT + 4].copy_from_slice(&self.ibge.to_le_bytes());
        buf[YEAR_AT..YEAR_AT + 2].copy_from_slice(&self.year.to_le_bytes());
        buf[SEX_AT] = self.sex.to_byte();
        write_f64(&mut buf, QUANTITY_AT, self.quantity);

        let name = stored_name(&self.municipio).as_bytes();
        let field = &mut buf[NAME_AT..NAME_AT + NAME_LEN];
        field[..name.len()].copy_from_slice(name);
        field[name.len()..].fill(NAME_FILL);

        write_f64(&mut buf, LATITUDE_AT, self.latitude);
        write_f64(&mut buf, LONGITUDE_AT, self.longitude);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != RECORD_SIZE {
            return Err(Error::new(ErrorKind::MalformedRecord).with_message(format!(
                "record must be {RECORD_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let sex = Sex::from_byte(buf[SEX_AT]).ok_or_else(|| {
            Error::new(ErrorKind::MalformedRecord)
                .with_message(format!("invalid sex byte 0x{:02x}", buf[SEX_AT]))
        })?;

        let field = &buf[NAME_AT..NAME_AT + NAME_LEN];
        let used = field
            .iter()
            .rposition(|byte| *byte != NAME_FILL)
            .map_or(0, |last| last + 1);
        let municipio = std::str::from_utf8(&field[..used]).map_err(|err| {
            Error::new(ErrorKind::MalformedRecord)
                .with_message("municipality name is not valid UTF-8")
                .with_source(err)
        })?;

        Ok(Self {
            ibge: u32::from_le_bytes(read_array(buf, IBGE_AT)),
            year: u16::from_le_bytes(read_array(buf, YEAR_AT)),
            sex,
            quantity: f64::from_le_bytes(read_array(buf, QUANTITY_AT)),
            municipio: municipio.to_string(),
            latitude: f64::from_le_bytes(read_array(buf, LATITUDE_AT)),
            longitude: f64::from_le_bytes(read_array(buf, LONGITUDE_AT)),
        })
    }
}

/// Returns the exact name a record will decode to once `name` is written:
/// the longest prefix within `NAME_LEN` bytes ending on a char boundary,
/// without trailing fill.
pub fn stored_name(name: &str) -> &str {
    let mut end = name.len().min(NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].trim_end_matches(NAME_FILL as char)
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

fn write_f64(buf: &mut [u8], offset: usize, value: f64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{NAME_LEN, RECORD_SIZE, Record, Sex, stored_name};
    use crate::core::error::ErrorKind;

    fn porto_alegre() -> Record {
        Record {
            ibge: 4314902,
            year: 2021,
            sex: Sex::Female,
            quantity: 1234.5,
            municipio: "Porto Alegre".to_string(),
            latitude: -30.0346,
            longitude: -51.2177,
        }
    }

    #[test]
    fn record_round_trip() {
        let record = porto_alegre();
        let buf = record.encode();
        assert_eq!(buf.len(), RECORD_SIZE);
        assert_eq!(Record::decode(&buf).expect("decode"), record);
    }

    #[test]
    fn layout_offsets_are_fixed() {
        let record = porto_alegre();
        let buf = record.encode();
        assert_eq!(&buf[0..4], &4314902u32.to_le_bytes());
        assert_eq!(&buf[4..6], &2021u16.to_le_bytes());
        assert_eq!(buf[6], b'F');
        assert_eq!(&buf[7..15], &1234.5f64.to_le_bytes());
        assert_eq!(&buf[15..27], b"Porto Alegre");
        assert!(buf[27..79].iter().all(|byte| *byte == b' '));
        assert_eq!(&buf[79..87], &(-30.0346f64).to_le_bytes());
        assert_eq!(&buf[87..95], &(-51.2177f64).to_le_bytes());
    }

    #[test]
    fn blank_sex_and_defaults_round_trip() {
        let record = Record {
            ibge: 0,
            year: 2019,
            sex: Sex::Blank,
            quantity: 0.0,
            municipio: String::new(),
            latitude: 0.0,
            longitude: 0.0,
        };
        let decoded = Record::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn long_name_truncates_on_char_boundary() {
        // 63 ASCII bytes followed by a two-byte char that would straddle the limit.
        let name = format!("{}ã tail", "a".repeat(NAME_LEN - 1));
        let record = Record {
            municipio: name.clone(),
            ..porto_alegre()
        };
        let decoded = Record::decode(&record.encode()).expect("truncated name decodes");
        assert_eq!(decoded.municipio, "a".repeat(NAME_LEN - 1));
        assert_eq!(decoded.municipio, stored_name(&name));
    }

    #[test]
    fn multibyte_names_fill_the_budget() {
        let name = "ç".repeat(40);
        let stored = stored_name(&name).to_string();
        assert_eq!(stored.len(), NAME_LEN);
        let record = Record {
            municipio: name,
            ..porto_alegre()
        };
        let decoded = Record::decode(&record.encode()).expect("decode");
        assert_eq!(decoded.municipio, stored);
    }

    #[test]
    fn trailing_spaces_are_fill() {
        assert_eq!(stored_name("Canoas   "), "Canoas");
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let buf = porto_alegre().encode();
        let err = Record::decode(&buf[..RECORD_SIZE - 1]).expect_err("short");
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn decode_rejects_invalid_utf8_name() {
        let mut buf = porto_alegre().encode();
        buf[15] = 0xC3;
        buf[16] = 0x28;
        let err = Record::decode(&buf).expect_err("bad utf8");
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn decode_rejects_unknown_sex_byte() {
        let mut buf = porto_alegre().encode();
        buf[6] = b'X';
        let err = Record::decode(&buf).expect_err("bad sex");
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn sex_filter_parsing() {
        assert_eq!(Sex::parse_filter("").expect("empty"), None);
        assert_eq!(Sex::parse_filter("M").expect("m"), Some(Sex::Male));
        assert_eq!(Sex::parse_filter("f").expect("f"), Some(Sex::Female));
        let err = Sex::parse_filter("X").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
