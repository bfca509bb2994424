//! Java type names, JVM descriptors, and the mapping between them.
//!
//! Selectors name parameter types the way Java source does (`int`,
//! `java.lang.String`, `byte[]`); class files identify overloads by
//! descriptor (`I`, `Ljava/lang/String;`, `[B`). Overload matching compares
//! descriptors, so `int` never matches `java.lang.Integer` or `long`.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JvmType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<JvmType>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeResolutionError {
    #[error("empty type name")]
    Empty,
    #[error("'void' is not a parameter type")]
    Void,
    #[error("'{0}' is not a valid Java type name")]
    InvalidName(String),
    #[error("malformed descriptor '{0}'")]
    MalformedDescriptor(String),
}

const PRIMITIVES: [(&str, JvmType); 8] = [
    ("boolean", JvmType::Boolean),
    ("byte", JvmType::Byte),
    ("char", JvmType::Char),
    ("short", JvmType::Short),
    ("int", JvmType::Int),
    ("long", JvmType::Long),
    ("float", JvmType::Float),
    ("double", JvmType::Double),
];

/// Resolves a source-style parameter type name into a [`JvmType`].
///
/// Every primitive keyword is recognized, arrays are written with trailing
/// `[]` pairs, and anything else must be a dotted binary class name.
pub fn resolve_type_name(name: &str) -> Result<JvmType, TypeResolutionError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TypeResolutionError::Empty);
    }

    let mut element = name;
    let mut dimensions = 0;
    while let Some(stripped) = element.strip_suffix("[]") {
        element = stripped.trim_end();
        dimensions += 1;
    }

    let mut ty = if element == "void" {
        return Err(TypeResolutionError::Void);
    } else if let Some((_, primitive)) = PRIMITIVES.iter().find(|(keyword, _)| *keyword == element) {
        primitive.clone()
    } else if is_binary_name(element) {
        JvmType::Object(element.replace('.', "/"))
    } else {
        return Err(TypeResolutionError::InvalidName(name.to_string()));
    };

    for _ in 0..dimensions {
        ty = JvmType::Array(Box::new(ty));
    }
    Ok(ty)
}

fn is_binary_name(name: &str) -> bool {
    const FORBIDDEN: &[char] = &[';', '/', '[', ']', '<', '>', '(', ')', ':', ','];
    name.split('.').all(|segment| {
        !segment.is_empty()
            && !segment.starts_with(|c: char| c.is_ascii_digit())
            && !segment.chars().any(|c| c.is_whitespace() || FORBIDDEN.contains(&c))
    })
}

impl JvmType {
    pub fn descriptor(&self) -> String {
        let mut out = String::new();
        self.write_descriptor(&mut out);
        out
    }

    fn write_descriptor(&self, out: &mut String) {
        match self {
            JvmType::Boolean => out.push('Z'),
            JvmType::Byte => out.push('B'),
            JvmType::Char => out.push('C'),
            JvmType::Short => out.push('S'),
            JvmType::Int => out.push('I'),
            JvmType::Long => out.push('J'),
            JvmType::Float => out.push('F'),
            JvmType::Double => out.push('D'),
            JvmType::Void => out.push('V'),
            JvmType::Object(name) => {
                out.push('L');
                out.push_str(name);
                out.push(';');
            }
            JvmType::Array(element) => {
                out.push('[');
                element.write_descriptor(out);
            }
        }
    }

    /// Local variable / operand stack slots taken by a value of this type.
    pub fn slots(&self) -> u16 {
        match self {
            JvmType::Void => 0,
            JvmType::Long | JvmType::Double => 2,
            _ => 1,
        }
    }

    /// Name of the class constant that denotes this reference type: the
    /// internal name for classes, the descriptor for arrays.
    pub fn class_constant_name(&self) -> Option<String> {
        match self {
            JvmType::Object(name) => Some(name.clone()),
            JvmType::Array(_) => Some(self.descriptor()),
            _ => None,
        }
    }

    /// Source-style name: `int`, `java.lang.String`, `long[]`.
    pub fn source_name(&self) -> String {
        self.to_string()
    }

    fn parse_one(desc: &str) -> Option<(JvmType, &str)> {
        let mut chars = desc.chars();
        let ty = match chars.next()? {
            'Z' => JvmType::Boolean,
            'B' => JvmType::Byte,
            'C' => JvmType::Char,
            'S' => JvmType::Short,
            'I' => JvmType::Int,
            'J' => JvmType::Long,
            'F' => JvmType::Float,
            'D' => JvmType::Double,
            'V' => JvmType::Void,
            'L' => {
                let end = desc.find(';')?;
                let name = &desc[1..end];
                if name.is_empty() {
                    return None;
                }
                return Some((JvmType::Object(name.to_string()), &desc[end + 1..]));
            }
            '[' => {
                let (element, rest) = JvmType::parse_one(&desc[1..])?;
                if element == JvmType::Void {
                    return None;
                }
                return Some((JvmType::Array(Box::new(element)), rest));
            }
            _ => return None,
        };
        Some((ty, chars.as_str()))
    }
}

impl fmt::Display for JvmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JvmType::Boolean => f.write_str("boolean"),
            JvmType::Byte => f.write_str("byte"),
            JvmType::Char => f.write_str("char"),
            JvmType::Short => f.write_str("short"),
            JvmType::Int => f.write_str("int"),
            JvmType::Long => f.write_str("long"),
            JvmType::Float => f.write_str("float"),
            JvmType::Double => f.write_str("double"),
            JvmType::Void => f.write_str("void"),
            JvmType::Object(name) => f.write_str(&name.replace('/', ".")),
            JvmType::Array(element) => write!(f, "{element}[]"),
        }
    }
}

/// A parsed method descriptor such as `(Ljava/lang/String;I)V`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<JvmType>,
    pub ret: JvmType,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<Self, TypeResolutionError> {
        let malformed = || TypeResolutionError::MalformedDescriptor(desc.to_string());

        let mut rest = desc.strip_prefix('(').ok_or_else(malformed)?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            let (ty, tail) = JvmType::parse_one(rest).ok_or_else(malformed)?;
            if ty == JvmType::Void {
                return Err(malformed());
            }
            params.push(ty);
            rest = tail;
        }

        let (ret, tail) = JvmType::parse_one(&rest[1..]).ok_or_else(malformed)?;
        if !tail.is_empty() {
            return Err(malformed());
        }
        Ok(Self { params, ret })
    }

    /// Slots taken by the parameters, not counting `this`.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(JvmType::slots).sum()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for param in &self.params {
            f.write_str(&param.descriptor())?;
        }
        write!(f, "){}", self.ret.descriptor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_primitive_keyword_resolves() {
        let expected = ["Z", "B", "C", "S", "I", "J", "F", "D"];
        for ((keyword, _), desc) in PRIMITIVES.iter().zip(expected) {
            assert_eq!(resolve_type_name(keyword).unwrap().descriptor(), desc, "{keyword}");
        }
    }

    #[test]
    fn reference_and_array_names_resolve() {
        assert_eq!(resolve_type_name("java.lang.String").unwrap().descriptor(), "Ljava/lang/String;");
        assert_eq!(resolve_type_name("byte[]").unwrap().descriptor(), "[B");
        assert_eq!(resolve_type_name(" java.lang.Object[][] ").unwrap().descriptor(), "[[Ljava/lang/Object;");
        assert_eq!(resolve_type_name("java.util.Map$Entry").unwrap().descriptor(), "Ljava/util/Map$Entry;");
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert_eq!(resolve_type_name(""), Err(TypeResolutionError::Empty));
        assert_eq!(resolve_type_name("void"), Err(TypeResolutionError::Void));
        for bad in ["java..String", "java/lang/String", "Ljava.lang.String;", "java.util.List<String>", "in t", "[]", ".Foo"] {
            assert!(resolve_type_name(bad).is_err(), "{bad} should not resolve");
        }
    }

    #[test]
    fn method_descriptor_parses_params_and_return() {
        let desc = MethodDescriptor::parse("(Ljava/lang/String;J[IZ)Ljava/net/InetAddress;").unwrap();
        assert_eq!(
            desc.params,
            vec![
                JvmType::Object("java/lang/String".into()),
                JvmType::Long,
                JvmType::Array(Box::new(JvmType::Int)),
                JvmType::Boolean,
            ]
        );
        assert_eq!(desc.ret, JvmType::Object("java/net/InetAddress".into()));
        assert_eq!(desc.param_slots(), 5);
        assert_eq!(desc.to_string(), "(Ljava/lang/String;J[IZ)Ljava/net/InetAddress;");
    }

    #[test]
    fn malformed_method_descriptors_fail() {
        for bad in ["", "()", "(V)V", "(L;)V", "(I)VV", "I)V", "(Q)V", "([V)V"] {
            assert!(MethodDescriptor::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn display_uses_source_names() {
        let ty = resolve_type_name("java.lang.String[]").unwrap();
        assert_eq!(ty.source_name(), "java.lang.String[]");
        assert_eq!(JvmType::Long.slots(), 2);
        assert_eq!(ty.class_constant_name().as_deref(), Some("[Ljava/lang/String;"));
    }
}
