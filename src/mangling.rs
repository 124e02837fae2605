//! Parser for the mangled type names stored in field descriptors and nested-type instructions.
//!
//! ```text
//! type          := generic-param assoc* | nominal generic-args? | builtin
//! generic-param := 'x' | 'q' index | 'qd' index index
//! index         := '_' | <decimal> '_'
//! nominal       := (<decimal-length> <identifier>)+ ('V' | 'O' | 'C')
//! generic-args  := 'y' type+ 'G'
//! builtin       := 'S' <letter> | 'B' <alphanumeric>* '_' | 'yt'
//! assoc         := 'Qy' index index
//! ```
use crate::error::LookupError;
use std::fmt::{self, Display, Formatter};

/// Associated type `index` of the conformance at `conformance` in the containing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociatedTypeRef {
    pub conformance: u32,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MangledType {
    Builtin(String),
    Nominal {
        name: String,
        arguments: Vec<MangledType>,
    },
    GenericParam {
        depth: u32,
        index: u32,
        associated: Vec<AssociatedTypeRef>,
    },
}

impl MangledType {
    pub fn parse(text: &str) -> Result<Self, LookupError> {
        let mut parser = Parser { text, position: 0 };
        let parsed = parser.parse_type()?;
        if parser.position != text.len() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(parsed)
    }

    pub fn is_generic_param(&self) -> bool {
        matches!(self, MangledType::GenericParam { .. })
    }
}

impl Display for MangledType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MangledType::Builtin(name) => f.write_str(name),
            MangledType::Nominal { name, arguments } => {
                f.write_str(name)?;
                if !arguments.is_empty() {
                    f.write_str("y")?;
                    for argument in arguments {
                        write!(f, "{argument}")?;
                    }
                    f.write_str("G")?;
                }
                Ok(())
            }
            MangledType::GenericParam {
                depth,
                index,
                associated,
            } => {
                match (*depth, *index) {
                    (0, 0) => f.write_str("x")?,
                    (0, i) => write!(f, "q{}", Index(i - 1))?,
                    (d, i) => write!(f, "qd{}{}", Index(d - 1), Index(i))?,
                }
                for assoc in associated {
                    write!(f, "Qy{}{}", Index(assoc.conformance), Index(assoc.index))?;
                }
                Ok(())
            }
        }
    }
}

struct Index(u32);

impl Display for Index {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("_"),
            n => write!(f, "{}_", n - 1),
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> LookupError {
        LookupError::Demangle {
            name: self.text.to_string(),
            position: self.position,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.position).copied()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.text[self.position..].starts_with(s)
    }

    fn next(&mut self) -> Result<u8, LookupError> {
        let c = self.peek().ok_or_else(|| self.error("unexpected end of name"))?;
        self.position += 1;
        Ok(c)
    }

    fn expect(&mut self, c: u8) -> Result<(), LookupError> {
        if self.peek() == Some(c) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c as char)))
        }
    }

    fn decimal(&mut self) -> Result<Option<u32>, LookupError> {
        let start = self.position;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.position += 1;
        }
        if start == self.position {
            return Ok(None);
        }
        self.text[start..self.position]
            .parse()
            .map(Some)
            .map_err(|_| self.error("number out of range"))
    }

    fn index(&mut self) -> Result<u32, LookupError> {
        let value = match self.decimal()? {
            None => 0,
            Some(n) => n
                .checked_add(1)
                .ok_or_else(|| self.error("index out of range"))?,
        };
        self.expect(b'_')?;
        Ok(value)
    }

    fn parse_type(&mut self) -> Result<MangledType, LookupError> {
        match self.peek() {
            Some(b'x') => {
                self.position += 1;
                self.generic_param(0, 0)
            }
            Some(b'q') => {
                self.position += 1;
                if self.peek() == Some(b'd') {
                    self.position += 1;
                    let depth = self.index()?;
                    let index = self.index()?;
                    self.generic_param(depth.saturating_add(1), index)
                } else {
                    let index = self.index()?;
                    self.generic_param(0, index.saturating_add(1))
                }
            }
            Some(b'y') if self.peek_str("yt") => {
                self.position += 2;
                Ok(MangledType::Builtin("yt".into()))
            }
            Some(b'S') => {
                let start = self.position;
                self.position += 1;
                if !self.next()?.is_ascii_alphabetic() {
                    self.position -= 1;
                    return Err(self.error("expected a standard type letter"));
                }
                Ok(MangledType::Builtin(self.text[start..self.position].into()))
            }
            Some(b'B') => {
                let start = self.position;
                self.position += 1;
                while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
                    self.position += 1;
                }
                self.expect(b'_')?;
                Ok(MangledType::Builtin(self.text[start..self.position].into()))
            }
            Some(c) if c.is_ascii_digit() => self.nominal(),
            Some(_) => Err(self.error("unrecognized type")),
            None => Err(self.error("unexpected end of name")),
        }
    }

    fn generic_param(&mut self, depth: u32, index: u32) -> Result<MangledType, LookupError> {
        let mut associated = vec![];
        while self.peek_str("Qy") {
            self.position += 2;
            let conformance = self.index()?;
            let index = self.index()?;
            associated.push(AssociatedTypeRef { conformance, index });
        }
        Ok(MangledType::GenericParam {
            depth,
            index,
            associated,
        })
    }

    fn nominal(&mut self) -> Result<MangledType, LookupError> {
        let start = self.position;
        while let Some(length) = self.decimal()? {
            let length = length as usize;
            let end = self.position + length;
            if length == 0 || end > self.text.len() || !self.text.is_char_boundary(end) {
                return Err(self.error("identifier length out of range"));
            }
            self.position = end;
        }
        match self.next()? {
            b'V' | b'O' | b'C' => {}
            _ => {
                self.position -= 1;
                return Err(self.error("expected a nominal type kind"));
            }
        }
        let name = self.text[start..self.position].to_string();

        let mut arguments = vec![];
        if self.peek() == Some(b'y') {
            self.position += 1;
            while self.peek() != Some(b'G') {
                arguments.push(self.parse_type()?);
            }
            self.position += 1;
            if arguments.is_empty() {
                return Err(self.error("empty generic argument list"));
            }
        }
        Ok(MangledType::Nominal { name, arguments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nominal(name: &str, arguments: Vec<MangledType>) -> MangledType {
        MangledType::Nominal {
            name: name.into(),
            arguments,
        }
    }

    fn param(depth: u32, index: u32) -> MangledType {
        MangledType::GenericParam {
            depth,
            index,
            associated: vec![],
        }
    }

    #[test]
    fn test_generic_params() {
        assert_eq!(MangledType::parse("x").unwrap(), param(0, 0));
        assert_eq!(MangledType::parse("q_").unwrap(), param(0, 1));
        assert_eq!(MangledType::parse("q0_").unwrap(), param(0, 2));
        assert_eq!(MangledType::parse("qd__").unwrap(), param(1, 0));
        assert_eq!(MangledType::parse("qd0_1_").unwrap(), param(2, 2));
    }

    #[test]
    fn test_associated_types() {
        assert_eq!(
            MangledType::parse("xQy_0_").unwrap(),
            MangledType::GenericParam {
                depth: 0,
                index: 0,
                associated: vec![AssociatedTypeRef {
                    conformance: 0,
                    index: 1
                }],
            }
        );
    }

    #[test]
    fn test_nominal_and_generic_args() {
        assert_eq!(
            MangledType::parse("4main3BoxVySiG").unwrap(),
            nominal("4main3BoxV", vec![MangledType::Builtin("Si".into())])
        );
        assert_eq!(
            MangledType::parse("4main4PairVyxytG").unwrap(),
            nominal(
                "4main4PairV",
                vec![param(0, 0), MangledType::Builtin("yt".into())]
            )
        );
        assert_eq!(
            MangledType::parse("4main3BoxVy4main3BoxVyBi64_GG").unwrap(),
            nominal(
                "4main3BoxV",
                vec![nominal("4main3BoxV", vec![MangledType::Builtin("Bi64_".into())])]
            )
        );
    }

    #[test]
    fn test_display_round_trip() {
        for name in ["x", "q_", "qd0_1_", "xQy_0_", "4main3BoxVySiG", "Bi8_", "yt"] {
            assert_eq!(MangledType::parse(name).unwrap().to_string(), name);
        }
    }

    #[test]
    fn test_errors() {
        let error = MangledType::parse("4main3BoxVySi").unwrap_err();
        assert!(matches!(error, LookupError::Demangle { position: 13, .. }), "{error:?}");
        assert!(MangledType::parse("4maV").is_err());
        assert!(MangledType::parse("SiX").is_err());
        assert!(MangledType::parse("").is_err());
        assert!(MangledType::parse("q").is_err());
    }
}
