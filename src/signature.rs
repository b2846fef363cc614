// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Method descriptors and their JDWP signature encoding.
//!
//! The target's debug protocol disambiguates overloads by an erased signature string such
//! as `(I[Ljava/lang/String;)V`. This module turns a [`MethodDescriptor`] into that string:
//!
//! - primitives map to a single letter (`B Z I D S C J F V`)
//! - every array dimension adds one `[` before the element encoding
//! - reference types become `L<name with '/' separators>;`
//!
//! Parameters are encoded in declaration order inside parentheses, followed by the return
//! type. Constructors are named `<init>` and always return `V`.
//!
//! ```rust
//! use invocount::{MethodDescriptor, TypeDescriptor};
//!
//! let put = MethodDescriptor::method(
//!     "java.util.HashMap",
//!     "put",
//!     vec![TypeDescriptor::object(), TypeDescriptor::object()],
//!     TypeDescriptor::object(),
//! );
//! assert_eq!(
//!     put.signature().unwrap().as_str(),
//!     "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;"
//! );
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

/// Name the target uses for constructors.
pub const CONSTRUCTOR_NAME: &str = "<init>";

const INVALID_NAME_CHARS: &[char] = &[';', '[', '/', '<', '>', '(', ')', '#', ','];

/// A parameter or return type at erasure level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Byte,
    Boolean,
    Int,
    Double,
    Short,
    Char,
    Long,
    Float,
    Void,
    /// One array dimension around an element type.
    Array(Box<TypeDescriptor>),
    /// A class or interface by fully-qualified binary name (`java.util.Map$Entry`).
    Reference(String),
}

impl TypeDescriptor {
    /// Creates a reference type from a fully-qualified binary name.
    pub fn reference(name: impl Into<String>) -> Self {
        TypeDescriptor::Reference(name.into())
    }

    /// `java.lang.Object`
    pub fn object() -> Self {
        TypeDescriptor::reference("java.lang.Object")
    }

    /// `java.lang.String`
    pub fn string() -> Self {
        TypeDescriptor::reference("java.lang.String")
    }

    /// Wraps `element` in `dimensions` array dimensions.
    pub fn array_of(element: TypeDescriptor, dimensions: usize) -> Self {
        (0..dimensions).fold(element, |inner, _| TypeDescriptor::Array(Box::new(inner)))
    }

    /// Encodes this type alone, e.g. `[[I` for `int[][]`.
    pub fn encode(&self) -> Result<String> {
        let mut out = String::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut String) -> Result<()> {
        match self {
            TypeDescriptor::Byte => out.push('B'),
            TypeDescriptor::Boolean => out.push('Z'),
            TypeDescriptor::Int => out.push('I'),
            TypeDescriptor::Double => out.push('D'),
            TypeDescriptor::Short => out.push('S'),
            TypeDescriptor::Char => out.push('C'),
            TypeDescriptor::Long => out.push('J'),
            TypeDescriptor::Float => out.push('F'),
            TypeDescriptor::Void => out.push('V'),
            TypeDescriptor::Array(element) => {
                if element.is_void() {
                    return Err(unsupported(self.to_string()));
                }
                out.push('[');
                element.encode_into(out)?;
            }
            TypeDescriptor::Reference(name) => {
                validate_binary_name(name)?;
                out.push('L');
                out.extend(name.chars().map(|c| if c == '.' { '/' } else { c }));
                out.push(';');
            }
        }
        Ok(())
    }

    fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Void)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Byte => f.write_str("byte"),
            TypeDescriptor::Boolean => f.write_str("boolean"),
            TypeDescriptor::Int => f.write_str("int"),
            TypeDescriptor::Double => f.write_str("double"),
            TypeDescriptor::Short => f.write_str("short"),
            TypeDescriptor::Char => f.write_str("char"),
            TypeDescriptor::Long => f.write_str("long"),
            TypeDescriptor::Float => f.write_str("float"),
            TypeDescriptor::Void => f.write_str("void"),
            TypeDescriptor::Array(element) => write!(f, "{element}[]"),
            TypeDescriptor::Reference(name) => f.write_str(name),
        }
    }
}

/// Parses source-form type names: `int`, `java.lang.String`, `long[][]`.
impl FromStr for TypeDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut base = s.trim();
        let mut dimensions = 0;
        while let Some(stripped) = base.strip_suffix("[]") {
            base = stripped.trim_end();
            dimensions += 1;
        }

        let element = match base {
            "byte" => TypeDescriptor::Byte,
            "boolean" => TypeDescriptor::Boolean,
            "int" => TypeDescriptor::Int,
            "double" => TypeDescriptor::Double,
            "short" => TypeDescriptor::Short,
            "char" => TypeDescriptor::Char,
            "long" => TypeDescriptor::Long,
            "float" => TypeDescriptor::Float,
            "void" if dimensions == 0 => TypeDescriptor::Void,
            "void" => return Err(unsupported(s.trim())),
            name => {
                validate_binary_name(name)?;
                TypeDescriptor::Reference(name.to_string())
            }
        };
        Ok(TypeDescriptor::array_of(element, dimensions))
    }
}

fn validate_binary_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| !segment.is_empty())
        && !name
            .chars()
            .any(|c| c.is_whitespace() || INVALID_NAME_CHARS.contains(&c));
    if valid {
        Ok(())
    } else {
        Err(unsupported(name))
    }
}

fn unsupported(type_name: impl Into<String>) -> Error {
    Error::UnsupportedType {
        type_name: type_name.into(),
    }
}

/// The protocol-level signature of a method, e.g. `(ILjava/lang/String;)Z`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodedSignature(String);

impl EncodedSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EncodedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encodes a method or constructor descriptor into its protocol signature.
pub fn encode(descriptor: &MethodDescriptor) -> Result<EncodedSignature> {
    let mut out = String::from("(");
    for parameter in &descriptor.parameters {
        if parameter.is_void() {
            return Err(unsupported(parameter.to_string()));
        }
        parameter.encode_into(&mut out)?;
    }
    out.push(')');
    match &descriptor.return_type {
        Some(return_type) => return_type.encode_into(&mut out)?,
        None => out.push('V'),
    }
    Ok(EncodedSignature(out))
}

/// A method or constructor to instrument.
///
/// Immutable once built. The encoded signature is computed on first use and cached.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    owner: String,
    name: String,
    parameters: Vec<TypeDescriptor>,
    return_type: Option<TypeDescriptor>,
    encoded: OnceLock<EncodedSignature>,
}

impl MethodDescriptor {
    /// Describes a method of `owner` with the given parameter and return types.
    pub fn method(
        owner: impl Into<String>,
        name: impl Into<String>,
        parameters: Vec<TypeDescriptor>,
        return_type: TypeDescriptor,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            parameters,
            return_type: Some(return_type),
            encoded: OnceLock::new(),
        }
    }

    /// Describes a constructor of `owner`.
    pub fn constructor(owner: impl Into<String>, parameters: Vec<TypeDescriptor>) -> Self {
        Self {
            owner: owner.into(),
            name: CONSTRUCTOR_NAME.to_string(),
            parameters,
            return_type: None,
            encoded: OnceLock::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Method name as the target knows it (`<init>` for constructors).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[TypeDescriptor] {
        &self.parameters
    }

    /// `None` for constructors.
    pub fn return_type(&self) -> Option<&TypeDescriptor> {
        self.return_type.as_ref()
    }

    pub fn is_constructor(&self) -> bool {
        self.return_type.is_none()
    }

    /// Returns the cached encoded signature, computing it on first call.
    pub fn signature(&self) -> Result<EncodedSignature> {
        if let Some(cached) = self.encoded.get() {
            return Ok(cached.clone());
        }
        let signature = encode(self)?;
        Ok(self.encoded.get_or_init(|| signature).clone())
    }

    /// JDWP class signature of the owning type, e.g. `Ljava/util/HashMap;`.
    pub fn class_signature(&self) -> Result<String> {
        TypeDescriptor::reference(self.owner.as_str()).encode()
    }

    /// The `class#method+signature` key used by the invocation ledger.
    pub fn key(&self) -> Result<MethodKey> {
        let signature = self.signature()?;
        Ok(MethodKey::new(
            self.owner.as_str(),
            format!("{}{}", self.name, signature),
        ))
    }
}

impl PartialEq for MethodDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
            && self.name == other.name
            && self.parameters == other.parameters
            && self.return_type == other.return_type
    }
}

impl Eq for MethodDescriptor {}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}(", self.owner, self.name)?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{parameter}")?;
        }
        f.write_str(")")?;
        if let Some(return_type) = &self.return_type {
            write!(f, " {return_type}")?;
        }
        Ok(())
    }
}

/// Parses `Owner#name(T1, T2) Ret`. A missing return type means `void`;
/// `Owner#<init>(T1)` describes a constructor.
impl FromStr for MethodDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || unsupported(s.trim());

        let (owner, rest) = s.trim().split_once('#').ok_or_else(malformed)?;
        let open = rest.find('(').ok_or_else(malformed)?;
        let close = rest.rfind(')').ok_or_else(malformed)?;
        if close < open {
            return Err(malformed());
        }

        let owner = owner.trim();
        validate_binary_name(owner)?;
        let name = rest[..open].trim();
        if name.is_empty() {
            return Err(malformed());
        }

        let parameter_list = rest[open + 1..close].trim();
        let parameters = if parameter_list.is_empty() {
            Vec::new()
        } else {
            parameter_list
                .split(',')
                .map(TypeDescriptor::from_str)
                .collect::<Result<Vec<_>>>()?
        };

        let return_part = rest[close + 1..].trim();
        if name == CONSTRUCTOR_NAME {
            if !return_part.is_empty() {
                return Err(malformed());
            }
            return Ok(MethodDescriptor::constructor(owner, parameters));
        }

        let return_type = if return_part.is_empty() {
            TypeDescriptor::Void
        } else {
            return_part.parse()?
        };
        Ok(MethodDescriptor::method(owner, name, parameters, return_type))
    }
}

/// Identifies an instrumented method as `class#name+signature`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    class: Arc<str>,
    member: Arc<str>,
}

impl MethodKey {
    pub fn new(class: impl Into<Arc<str>>, member: impl Into<Arc<str>>) -> Self {
        Self {
            class: class.into(),
            member: member.into(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Method name followed by its encoded signature, e.g. `hashCode()I`.
    pub fn member(&self) -> &str {
        &self.member
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.member)
    }
}
