//! Kernel calling-convention schema.
//!
//! A [`ParameterSchema`] is the ordered list of a kernel's parameters with
//! their semantic types. Order is authoritative for positional binding.
//!
//! Schemas come from two places:
//! - driver introspection (see [`KernelCompiler`](crate::KernelCompiler)),
//! - the source text itself ([`ParameterSchema::from_source`]), used when
//!   the driver refuses to describe a parameter.
//!
//! Both paths share [`ParamType::from_spelling`], so they agree on any
//! declaration the driver can describe.

use std::fmt;

use tracing::warn;

/// Token marking a kernel entry point in source text.
pub const KERNEL_MARKER: &str = "__kernel";

/// Qualifiers that never change the semantic type of a parameter.
pub(crate) const QUALIFIERS: &[&str] = &[
    "__global", "global", "__local", "local", "__constant", "constant",
    "__private", "private", "const", "restrict", "__restrict", "volatile",
    "__read_only", "__write_only", "read_only", "write_only",
];

// =============================================================================
// Types
// =============================================================================

/// Scalar kinds a kernel parameter (or pointee) can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    /// Two-component float vector.
    Float2,
}

impl ScalarKind {
    /// Parse a device-language type spelling (lowercase, no qualifiers).
    pub fn from_spelling(spelling: &str) -> Option<Self> {
        let kind = match spelling {
            "char" => Self::Char,
            "uchar" | "unsigned char" => Self::UChar,
            "short" => Self::Short,
            "ushort" | "unsigned short" => Self::UShort,
            "int" => Self::Int,
            "uint" | "unsigned int" | "unsigned" => Self::UInt,
            "long" => Self::Long,
            "ulong" | "unsigned long" => Self::ULong,
            "float" => Self::Float,
            "double" => Self::Double,
            "float2" | "vector2" => Self::Float2,
            _ => return None,
        };
        Some(kind)
    }

    /// Device-language spelling.
    pub fn spelling(&self) -> &'static str {
        match self {
            Self::Char => "char",
            Self::UChar => "uchar",
            Self::Short => "short",
            Self::UShort => "ushort",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Long => "long",
            Self::ULong => "ulong",
            Self::Float => "float",
            Self::Double => "double",
            Self::Float2 => "float2",
        }
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Long | Self::ULong | Self::Double | Self::Float2 => 8,
        }
    }

    /// Integer kinds.
    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::Float | Self::Double | Self::Float2)
    }
}

/// Semantic type of one kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// Scalar value.
    Scalar(ScalarKind),
    /// Pointer to device memory holding `ScalarKind` elements.
    Pointer(ScalarKind),
    /// Unrecognized spelling, kept so the rest of the schema stays usable.
    Opaque { spelling: String, pointer: bool },
}

impl ParamType {
    /// Map a type spelling to a semantic type.
    ///
    /// Unknown spellings are logged and recorded as [`ParamType::Opaque`].
    pub fn from_spelling(spelling: &str) -> Self {
        let raw = spelling.trim().trim_end_matches('\0');
        let pointer = raw.contains('*');
        let base = raw
            .replace('*', " ")
            .split_whitespace()
            .filter(|t| !QUALIFIERS.contains(t))
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();

        match (ScalarKind::from_spelling(&base), pointer) {
            (Some(kind), true) => Self::Pointer(kind),
            (Some(kind), false) => Self::Scalar(kind),
            (None, true) => {
                warn!(spelling = raw, "Unknown pointer type");
                Self::Opaque { spelling: raw.to_string(), pointer: true }
            }
            (None, false) => {
                warn!(spelling = raw, "Unknown argument type");
                Self::Opaque { spelling: raw.to_string(), pointer: false }
            }
        }
    }

    /// True for any pointer parameter, including opaque pointees.
    pub fn is_pointer(&self) -> bool {
        match self {
            Self::Pointer(_) => true,
            Self::Opaque { pointer, .. } => *pointer,
            Self::Scalar(_) => false,
        }
    }

    /// Scalar kind for value parameters.
    pub fn scalar(&self) -> Option<ScalarKind> {
        match self {
            Self::Scalar(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(kind) => f.write_str(kind.spelling()),
            Self::Pointer(kind) => write!(f, "{}*", kind.spelling()),
            Self::Opaque { spelling, .. } => write!(f, "opaque({})", spelling),
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// A scalar or vector value of a declared device width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    Float2([f32; 2]),
}

impl Scalar {
    /// Kind of this value.
    pub fn kind(&self) -> ScalarKind {
        match self {
            Self::Char(_) => ScalarKind::Char,
            Self::UChar(_) => ScalarKind::UChar,
            Self::Short(_) => ScalarKind::Short,
            Self::UShort(_) => ScalarKind::UShort,
            Self::Int(_) => ScalarKind::Int,
            Self::UInt(_) => ScalarKind::UInt,
            Self::Long(_) => ScalarKind::Long,
            Self::ULong(_) => ScalarKind::ULong,
            Self::Float(_) => ScalarKind::Float,
            Self::Double(_) => ScalarKind::Double,
            Self::Float2(_) => ScalarKind::Float2,
        }
    }

    /// Convert to the exact width `kind` declares.
    ///
    /// Numeric kinds convert freely (`as` semantics); vectors only convert
    /// to vectors.
    pub fn convert(&self, kind: ScalarKind) -> Option<Scalar> {
        if let Self::Float2(v) = self {
            return (kind == ScalarKind::Float2).then_some(Self::Float2(*v));
        }
        if kind == ScalarKind::Float2 {
            return None;
        }

        let value = match kind {
            ScalarKind::Float => Self::Float(self.as_f64() as f32),
            ScalarKind::Double => Self::Double(self.as_f64()),
            _ => {
                let i = self.as_i128();
                match kind {
                    ScalarKind::Char => Self::Char(i as i8),
                    ScalarKind::UChar => Self::UChar(i as u8),
                    ScalarKind::Short => Self::Short(i as i16),
                    ScalarKind::UShort => Self::UShort(i as u16),
                    ScalarKind::Int => Self::Int(i as i32),
                    ScalarKind::UInt => Self::UInt(i as u32),
                    ScalarKind::Long => Self::Long(i as i64),
                    _ => Self::ULong(i as u64),
                }
            }
        };
        Some(value)
    }

    fn as_f64(&self) -> f64 {
        match *self {
            Self::Char(v) => v as f64,
            Self::UChar(v) => v as f64,
            Self::Short(v) => v as f64,
            Self::UShort(v) => v as f64,
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Long(v) => v as f64,
            Self::ULong(v) => v as f64,
            Self::Float(v) => v as f64,
            Self::Double(v) => v,
            Self::Float2(v) => v[0] as f64,
        }
    }

    fn as_i128(&self) -> i128 {
        match *self {
            Self::Char(v) => v as i128,
            Self::UChar(v) => v as i128,
            Self::Short(v) => v as i128,
            Self::UShort(v) => v as i128,
            Self::Int(v) => v as i128,
            Self::UInt(v) => v as i128,
            Self::Long(v) => v as i128,
            Self::ULong(v) => v as i128,
            Self::Float(v) => v as i128,
            Self::Double(v) => v as i128,
            Self::Float2(v) => v[0] as i128,
        }
    }

    /// Native-endian bytes of the value, as the device expects them.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match *self {
            Self::Char(v) => v.to_ne_bytes().to_vec(),
            Self::UChar(v) => vec![v],
            Self::Short(v) => v.to_ne_bytes().to_vec(),
            Self::UShort(v) => v.to_ne_bytes().to_vec(),
            Self::Int(v) => v.to_ne_bytes().to_vec(),
            Self::UInt(v) => v.to_ne_bytes().to_vec(),
            Self::Long(v) => v.to_ne_bytes().to_vec(),
            Self::ULong(v) => v.to_ne_bytes().to_vec(),
            Self::Float(v) => v.to_ne_bytes().to_vec(),
            Self::Double(v) => v.to_ne_bytes().to_vec(),
            Self::Float2(v) => bytemuck::cast_slice(&v).to_vec(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Char(v) => write!(f, "{}", v),
            Self::UChar(v) => write!(f, "{}", v),
            Self::Short(v) => write!(f, "{}", v),
            Self::UShort(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::ULong(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Float2(v) => write!(f, "({}, {})", v[0], v[1]),
        }
    }
}

macro_rules! scalar_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

scalar_from! {
    i8 => Char,
    u8 => UChar,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f32 => Float,
    f64 => Double,
    [f32; 2] => Float2,
}

// =============================================================================
// Schema
// =============================================================================

/// One named kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: ParamType,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// Ordered parameter name -> type mapping of one kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    params: Vec<Parameter>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter (order is preserved).
    pub fn push(&mut self, param: Parameter) {
        self.params.push(param);
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    /// Parameter at position `index`.
    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    /// First parameter called `name`.
    pub fn find(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Number of pointer parameters.
    pub fn pointer_count(&self) -> usize {
        self.params.iter().filter(|p| p.ty.is_pointer()).count()
    }

    /// Human-readable signature, e.g. `(uchar*) 'pixels', (int) 'width'`.
    pub fn describe(&self) -> String {
        self.params
            .iter()
            .map(|p| format!("({}) '{}'", p.ty, p.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Parse the parameter list of the first kernel declared in `source`.
    ///
    /// Syntactic fallback: the text between the kernel's parentheses is
    /// split on commas and each parameter's last two tokens are taken as
    /// (type, name). Parameters with fewer than two tokens are skipped.
    pub fn from_source(source: &str) -> Self {
        let mut schema = Self::new();
        let Some(decl) = KernelDeclaration::find(source) else {
            warn!("Kernel function not found in source");
            return schema;
        };
        let Some(params) = decl.params else {
            warn!(kernel = decl.name, "Kernel arguments not found");
            return schema;
        };
        if params.trim().is_empty() {
            return schema;
        }

        for raw in params.split(',') {
            let tokens: Vec<&str> = raw.split_whitespace().collect();
            if tokens.len() < 2 {
                warn!(param = raw.trim(), "Kernel argument is invalid");
                continue;
            }

            let mut name = tokens[tokens.len() - 1].to_string();
            let mut type_name = tokens[tokens.len() - 2].to_string();
            // `uchar * pixels`
            if type_name == "*" && tokens.len() >= 3 {
                type_name = format!("{}*", tokens[tokens.len() - 3]);
            }
            // `uchar *pixels`
            while let Some(rest) = name.strip_prefix('*') {
                name = rest.to_string();
                type_name.push('*');
            }
            let name = name.trim_end_matches([';', ')', '\n', '\r', '\t']).to_string();

            schema.push(Parameter::new(name, ParamType::from_spelling(&type_name)));
        }

        schema
    }
}

impl FromIterator<Parameter> for ParameterSchema {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        Self { params: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a ParameterSchema {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

// =============================================================================
// Declaration scanning
// =============================================================================

/// The first kernel declaration found in a source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDeclaration<'a> {
    /// Identifier between the return type and `(` (trimmed).
    pub name: &'a str,
    /// Text between `(` and the next `)`; None when unterminated.
    pub params: Option<&'a str>,
}

impl<'a> KernelDeclaration<'a> {
    /// Locate the first `__kernel void <name>(...)` declaration.
    pub fn find(source: &'a str) -> Option<Self> {
        Self::find_all(source).next()
    }

    /// Iterate over every kernel declaration in `source`.
    pub fn find_all(source: &'a str) -> impl Iterator<Item = KernelDeclaration<'a>> + 'a {
        source
            .match_indices(KERNEL_MARKER)
            .filter_map(move |(at, _)| Self::parse_at(source, at + KERNEL_MARKER.len()))
    }

    fn parse_at(source: &'a str, start: usize) -> Option<Self> {
        let rest = &source[start..];
        let rest = rest.trim_start();
        let rest = rest.strip_prefix("void")?;
        let open = rest.find('(')?;
        let name = rest[..open].trim();
        if name.is_empty() {
            return None;
        }

        let after = &rest[open + 1..];
        let params = after.find(')').map(|close| &after[..close]);
        Some(Self { name, params })
    }

    /// Identifier contains whitespace (malformed, but still usable).
    pub fn name_has_whitespace(&self) -> bool {
        self.name.chars().any(char::is_whitespace)
    }
}
