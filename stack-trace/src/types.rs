use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scalar types that can live in a stack slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    U8,
    I8,
    U16,
    I16,
}

impl Primitive {
    /// Size in bytes.
    pub const fn size(&self) -> u32 {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
        }
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::I8 | Self::I16)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown primitive type: {0:?}")]
pub struct UnknownPrimitive(pub String);

/// Parses the assembler's size/format tags (`2h`, `1c`, ...) as well as the plain type names.
/// Matching ignores case.
impl FromStr for Primitive {
    type Err = UnknownPrimitive;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "2h" | "2u" | "u16" => Ok(Self::U16),
            "2d" | "2s" | "i16" => Ok(Self::I16),
            "1h" | "1u" | "u8" => Ok(Self::U8),
            "1d" | "1s" | "1c" | "i8" => Ok(Self::I8),
            _ => Err(UnknownPrimitive(s.to_owned())),
        }
    }
}

/// A named type. Struct members are themselves type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Primitive(Primitive),
    Struct(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("unknown type declaration command: {0:?}")]
    UnknownCommand(String),

    #[error("type declaration for {0:?} is missing its arguments")]
    MissingArguments(String),

    #[error(transparent)]
    UnknownPrimitive(#[from] UnknownPrimitive),
}

/// Maps symbol names to types.
///
/// Names that are not declared fall back to the primitive names, so `u16` and `2d` always
/// resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeRegistry {
    types: BTreeMap<String, Type>,
}

impl TypeRegistry {
    /// Nesting limit for struct members. Deeper or cyclic declarations have no size.
    const MAX_DEPTH: usize = 16;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: Type) -> Option<Type> {
        self.types.insert(name.into(), ty)
    }

    /// Declares `name` from an assembler type tag, either `type <primitive>` or
    /// `struct <member>...`.
    pub fn declare_tag(&mut self, name: &str, tag: &str) -> Result<(), TypeError> {
        let mut words = tag
            .trim()
            .trim_start_matches('@')
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|word| !word.is_empty());
        match words.next() {
            Some("type") => {
                let primitive = words
                    .next()
                    .ok_or_else(|| TypeError::MissingArguments(name.to_owned()))?
                    .parse()?;
                self.declare(name, Type::Primitive(primitive));
            }
            Some("struct") => {
                let members: Vec<String> = words.map(str::to_owned).collect();
                if members.is_empty() {
                    return Err(TypeError::MissingArguments(name.to_owned()));
                }
                self.declare(name, Type::Struct(members));
            }
            other => return Err(TypeError::UnknownCommand(other.unwrap_or_default().to_owned())),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.types.get(name)
    }

    /// Resolves a type name, falling back to the primitive names.
    pub fn resolve(&self, name: &str) -> Option<Type> {
        self.types
            .get(name)
            .cloned()
            .or_else(|| name.parse().ok().map(Type::Primitive))
    }

    /// Size in bytes of the named type. Structs occupy the sum of their members. A struct whose
    /// size does not fit in a `u32` has no size.
    pub fn size_of(&self, name: &str) -> Option<u32> {
        self.size_at_depth(name, 0, &mut BTreeMap::new())
    }

    // Any `None` aborts the whole query, so `sizes` only ever serves successful lookups.
    fn size_at_depth<'a>(
        &'a self,
        name: &'a str,
        depth: usize,
        sizes: &mut BTreeMap<&'a str, u32>,
    ) -> Option<u32> {
        if depth > Self::MAX_DEPTH {
            return None;
        }
        if let Some(size) = sizes.get(name) {
            return Some(*size);
        }
        let size = match self.types.get(name) {
            Some(Type::Primitive(primitive)) => primitive.size(),
            Some(Type::Struct(members)) => members.iter().try_fold(0u32, |size, member| {
                size.checked_add(self.size_at_depth(member, depth + 1, sizes)?)
            })?,
            None => name.parse::<Primitive>().ok()?.size(),
        };
        sizes.insert(name, size);
        Some(size)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_tags() {
        for (tag, primitive) in [
            ("2h", Primitive::U16),
            ("2U", Primitive::U16),
            ("2d", Primitive::I16),
            ("2S", Primitive::I16),
            ("1h", Primitive::U8),
            ("1u", Primitive::U8),
            ("1D", Primitive::I8),
            ("1s", Primitive::I8),
            ("1C", Primitive::I8),
            ("u16", Primitive::U16),
        ] {
            assert_eq!(tag.parse::<Primitive>(), Ok(primitive), "{tag}");
        }
        assert!("3h".parse::<Primitive>().is_err());
    }

    #[test]
    fn struct_sizes() {
        let mut types = TypeRegistry::new();
        types.declare_tag("x", "@type 2d").unwrap();
        types.declare_tag("c", "type 1c").unwrap();
        types.declare_tag("pair", "struct x, c").unwrap();
        types.declare_tag("nested", "struct pair pair u8").unwrap();

        assert_eq!(types.size_of("x"), Some(2));
        assert_eq!(types.size_of("pair"), Some(3));
        assert_eq!(types.size_of("nested"), Some(7));
        assert_eq!(types.size_of("i16"), Some(2));
        assert_eq!(types.size_of("missing"), None);
        assert_eq!(types.resolve("c"), Some(Type::Primitive(Primitive::I8)));
    }

    #[test]
    fn cyclic_structs_have_no_size() {
        let mut types = TypeRegistry::new();
        types.declare("a", Type::Struct(vec!["b".into()]));
        types.declare("b", Type::Struct(vec!["a".into()]));
        assert_eq!(types.size_of("a"), None);
    }

    #[test]
    fn oversized_structs_have_no_size() {
        let mut types = TypeRegistry::new();
        types.declare("t0", Type::Primitive(Primitive::U16));
        for level in 1..=4 {
            let member = format!("t{}", level - 1);
            types.declare(format!("t{level}"), Type::Struct(vec![member; 256]));
        }
        assert_eq!(types.size_of("t3"), Some(2 << 24));
        assert_eq!(types.size_of("t4"), None);
    }

    #[test]
    fn bad_declarations() {
        let mut types = TypeRegistry::new();
        assert!(matches!(
            types.declare_tag("x", "type"),
            Err(TypeError::MissingArguments(_))
        ));
        assert!(matches!(
            types.declare_tag("x", "type 4h"),
            Err(TypeError::UnknownPrimitive(_))
        ));
        assert!(matches!(
            types.declare_tag("x", "global"),
            Err(TypeError::UnknownCommand(_))
        ));
        assert!(types.is_empty());
    }
}
