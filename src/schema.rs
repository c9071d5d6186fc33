//! Schema model
//!
//! A GraphQL SDL document flattened into lookup maps: types by name, fields
//! and arguments by name, type references as [`TypeRef`]. Type extensions
//! are merged into the types they extend. The diff and the registry's
//! composition check both work on this model rather than on the raw AST.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use graphql_parser::schema::{
    parse_schema, Definition, Directive, EnumValue, Field, InputValue, Type, TypeDefinition,
    TypeExtension, Value,
};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

pub const DEFAULT_DEPRECATION_REASON: &str = "No longer supported";

const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

/// Kind of a named type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    #[default]
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Scalar => "ScalarTypeDefinition",
            TypeKind::Object => "ObjectTypeDefinition",
            TypeKind::Interface => "InterfaceTypeDefinition",
            TypeKind::Union => "UnionTypeDefinition",
            TypeKind::Enum => "EnumTypeDefinition",
            TypeKind::InputObject => "InputObjectTypeDefinition",
        }
    }

    fn is_input(&self) -> bool {
        matches!(self, TypeKind::Scalar | TypeKind::Enum | TypeKind::InputObject)
    }

    fn is_output(&self) -> bool {
        !matches!(self, TypeKind::InputObject)
    }
}

/// Reference to a type, with its list and non-null wrappers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    fn from_ast<'a>(ty: &Type<'a, &'a str>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.to_string()),
            Type::ListType(inner) => TypeRef::List(Box::new(Self::from_ast(inner))),
            Type::NonNullType(inner) => TypeRef::NonNull(Box::new(Self::from_ast(inner))),
        }
    }

    /// Innermost named type
    pub fn named(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    fn is_wrapping(&self) -> bool {
        !matches!(self, TypeRef::Named(_))
    }

    /// Whether clients reading a field still cope when its type changes from
    /// `self` to `new` (only added non-null wrappers are allowed)
    pub fn is_safe_output_change(&self, new: &TypeRef) -> bool {
        if !self.is_wrapping() && !new.is_wrapping() {
            return self == new;
        }
        if let TypeRef::NonNull(new_inner) = new {
            let old_inner = match self {
                TypeRef::NonNull(inner) => inner.as_ref(),
                other => other,
            };
            return old_inner.is_safe_output_change(new_inner);
        }
        if let TypeRef::List(old_inner) = self {
            return match new {
                TypeRef::List(new_inner) => old_inner.is_safe_output_change(new_inner),
                _ => false,
            };
        }
        false
    }

    /// Whether clients sending an input still cope when its type changes from
    /// `self` to `new` (only removed non-null wrappers are allowed)
    pub fn is_safe_input_change(&self, new: &TypeRef) -> bool {
        if !self.is_wrapping() && !new.is_wrapping() {
            return self == new;
        }
        if let (TypeRef::List(old_inner), TypeRef::List(new_inner)) = (self, new) {
            return old_inner.is_safe_input_change(new_inner);
        }
        if let TypeRef::NonNull(old_inner) = self {
            let new_inner = match new {
                TypeRef::NonNull(inner) => inner.as_ref(),
                other => other,
            };
            return old_inner.is_safe_input_change(new_inner);
        }
        false
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
        }
    }
}

/// Argument, input field or directive argument
#[derive(Debug, Clone, PartialEq)]
pub struct InputValueDef {
    pub ty: TypeRef,
    pub default_value: Option<String>,
    pub description: Option<String>,
}

impl InputValueDef {
    fn from_ast<'a>(value: &InputValue<'a, &'a str>) -> Self {
        Self {
            ty: TypeRef::from_ast(&value.value_type),
            default_value: value.default_value.as_ref().map(|v| v.to_string()),
            description: value.description.clone(),
        }
    }

    /// Non-null without a default: every caller must provide it
    pub fn is_required(&self) -> bool {
        self.ty.is_non_null() && self.default_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub ty: TypeRef,
    pub description: Option<String>,
    pub deprecation: Option<String>,
    pub args: BTreeMap<String, InputValueDef>,
}

impl FieldDef {
    fn from_ast<'a>(field: &Field<'a, &'a str>) -> Self {
        Self {
            ty: TypeRef::from_ast(&field.field_type),
            description: field.description.clone(),
            deprecation: deprecation_of(&field.directives),
            args: inputs_of(&field.arguments),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValueDef {
    pub description: Option<String>,
    pub deprecation: Option<String>,
}

impl EnumValueDef {
    fn from_ast<'a>(value: &EnumValue<'a, &'a str>) -> Self {
        Self {
            description: value.description.clone(),
            deprecation: deprecation_of(&value.directives),
        }
    }
}

/// Named type; only the maps matching its kind are populated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeDef {
    pub kind: TypeKind,
    pub description: Option<String>,
    pub interfaces: BTreeSet<String>,
    pub fields: BTreeMap<String, FieldDef>,
    pub input_fields: BTreeMap<String, InputValueDef>,
    pub members: BTreeSet<String>,
    pub values: BTreeMap<String, EnumValueDef>,
}

impl TypeDef {
    fn from_ast<'a>(definition: &TypeDefinition<'a, &'a str>) -> (String, Self) {
        match definition {
            TypeDefinition::Scalar(s) => (
                s.name.to_string(),
                Self {
                    kind: TypeKind::Scalar,
                    description: s.description.clone(),
                    ..Self::default()
                },
            ),
            TypeDefinition::Object(o) => (
                o.name.to_string(),
                Self {
                    kind: TypeKind::Object,
                    description: o.description.clone(),
                    interfaces: o.implements_interfaces.iter().map(|i| i.to_string()).collect(),
                    fields: fields_of(&o.fields),
                    ..Self::default()
                },
            ),
            TypeDefinition::Interface(i) => (
                i.name.to_string(),
                Self {
                    kind: TypeKind::Interface,
                    description: i.description.clone(),
                    fields: fields_of(&i.fields),
                    ..Self::default()
                },
            ),
            TypeDefinition::Union(u) => (
                u.name.to_string(),
                Self {
                    kind: TypeKind::Union,
                    description: u.description.clone(),
                    members: u.types.iter().map(|t| t.to_string()).collect(),
                    ..Self::default()
                },
            ),
            TypeDefinition::Enum(e) => (
                e.name.to_string(),
                Self {
                    kind: TypeKind::Enum,
                    description: e.description.clone(),
                    values: e
                        .values
                        .iter()
                        .map(|v| (v.name.to_string(), EnumValueDef::from_ast(v)))
                        .collect(),
                    ..Self::default()
                },
            ),
            TypeDefinition::InputObject(i) => (
                i.name.to_string(),
                Self {
                    kind: TypeKind::InputObject,
                    description: i.description.clone(),
                    input_fields: inputs_of(&i.fields),
                    ..Self::default()
                },
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveDef {
    pub args: BTreeMap<String, InputValueDef>,
    pub locations: BTreeSet<String>,
}

/// Root operation types
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRoots {
    pub query: Option<String>,
    pub mutation: Option<String>,
    pub subscription: Option<String>,
}

/// Parsed schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaModel {
    pub types: BTreeMap<String, TypeDef>,
    pub directives: BTreeMap<String, DirectiveDef>,
    pub roots: SchemaRoots,
}

impl SchemaModel {
    /// Parse SDL; syntax errors, duplicate types and extensions of unknown
    /// types fail with [`RegistryError::InvalidSchema`]
    pub fn parse(sdl: &str) -> Result<Self> {
        let document = parse_schema::<&str>(sdl)
            .map_err(|e| RegistryError::InvalidSchema(e.to_string()))?;

        let mut model = SchemaModel::default();
        let mut explicit_roots = None;
        let mut extensions = Vec::new();

        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(schema) => {
                    explicit_roots = Some(SchemaRoots {
                        query: schema.query.map(String::from),
                        mutation: schema.mutation.map(String::from),
                        subscription: schema.subscription.map(String::from),
                    });
                }
                Definition::TypeDefinition(definition) => {
                    let (name, ty) = TypeDef::from_ast(definition);
                    if model.types.insert(name.clone(), ty).is_some() {
                        return Err(RegistryError::InvalidSchema(format!(
                            "There can be only one type named '{}'",
                            name
                        )));
                    }
                }
                Definition::TypeExtension(extension) => extensions.push(extension),
                Definition::DirectiveDefinition(directive) => {
                    model.directives.insert(
                        directive.name.to_string(),
                        DirectiveDef {
                            args: inputs_of(&directive.arguments),
                            locations: directive
                                .locations
                                .iter()
                                .map(|l| l.as_str().to_string())
                                .collect(),
                        },
                    );
                }
            }
        }

        for extension in extensions {
            model.extend(extension)?;
        }

        model.roots = explicit_roots.unwrap_or_else(|| SchemaRoots {
            query: model.default_root("Query"),
            mutation: model.default_root("Mutation"),
            subscription: model.default_root("Subscription"),
        });

        Ok(model)
    }

    fn default_root(&self, name: &str) -> Option<String> {
        self.types.contains_key(name).then(|| name.to_string())
    }

    fn extend<'a>(&mut self, extension: &TypeExtension<'a, &'a str>) -> Result<()> {
        let name = match extension {
            TypeExtension::Scalar(e) => e.name,
            TypeExtension::Object(e) => e.name,
            TypeExtension::Interface(e) => e.name,
            TypeExtension::Union(e) => e.name,
            TypeExtension::Enum(e) => e.name,
            TypeExtension::InputObject(e) => e.name,
        };
        let ty = self.types.get_mut(name).ok_or_else(|| {
            RegistryError::InvalidSchema(format!("Cannot extend type '{}' because it is not defined", name))
        })?;

        match extension {
            TypeExtension::Scalar(_) => {}
            TypeExtension::Object(e) => {
                ty.interfaces
                    .extend(e.implements_interfaces.iter().map(|i| i.to_string()));
                ty.fields.extend(fields_of(&e.fields));
            }
            TypeExtension::Interface(e) => ty.fields.extend(fields_of(&e.fields)),
            TypeExtension::Union(e) => ty.members.extend(e.types.iter().map(|t| t.to_string())),
            TypeExtension::Enum(e) => ty.values.extend(
                e.values
                    .iter()
                    .map(|v| (v.name.to_string(), EnumValueDef::from_ast(v))),
            ),
            TypeExtension::InputObject(e) => ty.input_fields.extend(inputs_of(&e.fields)),
        }
        Ok(())
    }

    /// Type-system errors that make the schema unusable; empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match &self.roots.query {
            None => errors.push("Query root type must be provided.".to_string()),
            Some(query) => self.check_root("Query", query, &mut errors),
        }
        if let Some(mutation) = &self.roots.mutation {
            self.check_root("Mutation", mutation, &mut errors);
        }
        if let Some(subscription) = &self.roots.subscription {
            self.check_root("Subscription", subscription, &mut errors);
        }

        for (type_name, ty) in &self.types {
            for (field_name, field) in &ty.fields {
                let at = format!("{}.{}", type_name, field_name);
                self.check_reference(&at, &field.ty, false, &mut errors);
                for (arg_name, arg) in &field.args {
                    self.check_reference(&format!("{}({}:)", at, arg_name), &arg.ty, true, &mut errors);
                }
            }
            for (field_name, field) in &ty.input_fields {
                let at = format!("{}.{}", type_name, field_name);
                self.check_reference(&at, &field.ty, true, &mut errors);
            }
            for interface in &ty.interfaces {
                if self.kind_of(interface) != Some(TypeKind::Interface) {
                    errors.push(format!(
                        "Type {} must only implement Interface types, it cannot implement {}.",
                        type_name, interface
                    ));
                }
            }
            for member in &ty.members {
                if self.kind_of(member) != Some(TypeKind::Object) {
                    errors.push(format!(
                        "Union type {} can only include Object types, it cannot include {}.",
                        type_name, member
                    ));
                }
            }
        }

        errors
    }

    fn check_root(&self, operation: &str, name: &str, errors: &mut Vec<String>) {
        if self.kind_of(name) != Some(TypeKind::Object) {
            errors.push(format!(
                "{} root type must be Object type, it cannot be {}.",
                operation, name
            ));
        }
    }

    fn check_reference(&self, at: &str, ty: &TypeRef, input: bool, errors: &mut Vec<String>) {
        let named = ty.named();
        match self.kind_of(named) {
            None => errors.push(format!("Unknown type \"{}\" referenced at {}.", named, at)),
            Some(kind) if input && !kind.is_input() => errors.push(format!(
                "The type of {} must be Input Type but got: {}.",
                at, ty
            )),
            Some(kind) if !input && !kind.is_output() => errors.push(format!(
                "The type of {} must be Output Type but got: {}.",
                at, ty
            )),
            Some(_) => {}
        }
    }

    fn kind_of(&self, name: &str) -> Option<TypeKind> {
        if BUILTIN_SCALARS.contains(&name) {
            return Some(TypeKind::Scalar);
        }
        self.types.get(name).map(|t| t.kind)
    }
}

fn fields_of<'a>(fields: &[Field<'a, &'a str>]) -> BTreeMap<String, FieldDef> {
    fields
        .iter()
        .map(|f| (f.name.to_string(), FieldDef::from_ast(f)))
        .collect()
}

fn inputs_of<'a>(values: &[InputValue<'a, &'a str>]) -> BTreeMap<String, InputValueDef> {
    values
        .iter()
        .map(|v| (v.name.to_string(), InputValueDef::from_ast(v)))
        .collect()
}

fn deprecation_of<'a>(directives: &[Directive<'a, &'a str>]) -> Option<String> {
    let deprecated = directives.iter().find(|d| d.name == "deprecated")?;
    let reason = deprecated
        .arguments
        .iter()
        .find(|(name, _)| *name == "reason")
        .and_then(|(_, value)| match value {
            Value::String(reason) => Some(reason.clone()),
            _ => None,
        });
    Some(reason.unwrap_or_else(|| DEFAULT_DEPRECATION_REASON.to_string()))
}
