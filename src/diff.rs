//! Schema diff
//!
//! Structural comparison of two [`SchemaModel`]s. Every detected change
//! carries a criticality under the usual GraphQL compatibility rules. Changes
//! that only break clients actually selecting the affected coordinate are
//! marked usage-aware; the inspector may downgrade those to safe when usage
//! data shows the coordinate unused.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{DirectiveDef, FieldDef, InputValueDef, SchemaModel, TypeDef, TypeKind};

/// Severity of a schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Criticality {
    Breaking,
    Dangerous,
    Safe,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Criticality::Breaking => "Breaking",
            Criticality::Dangerous => "Dangerous",
            Criticality::Safe => "Safe",
        };
        f.write_str(s)
    }
}

/// What changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    TypeRemoved,
    TypeAdded,
    TypeKindChanged,
    TypeDescriptionChanged,
    FieldRemoved,
    FieldAdded,
    FieldTypeChanged,
    FieldDescriptionChanged,
    FieldDeprecationAdded,
    FieldDeprecationRemoved,
    FieldDeprecationReasonChanged,
    FieldArgumentRemoved,
    FieldArgumentAdded,
    FieldArgumentTypeChanged,
    FieldArgumentDefaultChanged,
    FieldArgumentDescriptionChanged,
    InputFieldRemoved,
    InputFieldAdded,
    InputFieldTypeChanged,
    InputFieldDefaultValueChanged,
    InputFieldDescriptionChanged,
    EnumValueRemoved,
    EnumValueAdded,
    EnumValueDescriptionChanged,
    EnumValueDeprecationAdded,
    EnumValueDeprecationRemoved,
    UnionMemberRemoved,
    UnionMemberAdded,
    ObjectTypeInterfaceRemoved,
    ObjectTypeInterfaceAdded,
    SchemaQueryTypeChanged,
    SchemaMutationTypeChanged,
    SchemaSubscriptionTypeChanged,
    DirectiveRemoved,
    DirectiveAdded,
    DirectiveArgumentRemoved,
    DirectiveArgumentAdded,
    DirectiveLocationRemoved,
    DirectiveLocationAdded,
}

impl ChangeKind {
    /// Breaks only clients that select the changed coordinate
    pub fn depends_on_usage(&self) -> bool {
        matches!(
            self,
            ChangeKind::TypeRemoved
                | ChangeKind::FieldRemoved
                | ChangeKind::FieldTypeChanged
                | ChangeKind::FieldArgumentRemoved
                | ChangeKind::FieldArgumentTypeChanged
                | ChangeKind::InputFieldRemoved
                | ChangeKind::EnumValueRemoved
        )
    }
}

/// A detected change between two schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub criticality: Criticality,
    pub message: String,
    /// Coordinate split on `.`, e.g. `["Query", "me"]`
    pub path: Option<Vec<String>>,
    /// Why the criticality was downgraded, if it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SchemaChange {
    fn new(kind: ChangeKind, criticality: Criticality, message: String, path: Option<&str>) -> Self {
        Self {
            kind,
            criticality,
            message,
            path: path.map(|p| p.split('.').map(String::from).collect()),
            reason: None,
        }
    }

    /// Schema coordinate of the change, e.g. `Query.me`
    pub fn coordinate(&self) -> Option<String> {
        self.path.as_ref().map(|p| p.join("."))
    }

    /// Breaking, but only for clients that use the coordinate
    pub fn is_usage_aware(&self) -> bool {
        self.criticality == Criticality::Breaking
            && self.kind.depends_on_usage()
            && self.path.is_some()
    }

    pub fn is_breaking(&self) -> bool {
        self.criticality == Criticality::Breaking
    }
}

/// All changes from `old` to `new`, in detection order
pub fn diff(old: &SchemaModel, new: &SchemaModel) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    detect_root_changes(old, new, &mut changes);
    detect_type_changes(&old.types, &new.types, &mut changes);
    detect_directive_changes(&old.directives, &new.directives, &mut changes);
    changes
}

fn detect_root_changes(old: &SchemaModel, new: &SchemaModel, changes: &mut Vec<SchemaChange>) {
    let roots = [
        ("query", ChangeKind::SchemaQueryTypeChanged, &old.roots.query, &new.roots.query),
        ("mutation", ChangeKind::SchemaMutationTypeChanged, &old.roots.mutation, &new.roots.mutation),
        (
            "subscription",
            ChangeKind::SchemaSubscriptionTypeChanged,
            &old.roots.subscription,
            &new.roots.subscription,
        ),
    ];

    for (operation, kind, old_root, new_root) in roots {
        if old_root == new_root {
            continue;
        }
        let criticality = if old_root.is_none() {
            Criticality::Safe
        } else {
            Criticality::Breaking
        };
        changes.push(SchemaChange::new(
            kind,
            criticality,
            format!(
                "Schema {} root has changed from '{}' to '{}'",
                operation,
                old_root.as_deref().unwrap_or("unknown"),
                new_root.as_deref().unwrap_or("unknown")
            ),
            None,
        ));
    }
}

fn detect_type_changes(
    old: &BTreeMap<String, TypeDef>,
    new: &BTreeMap<String, TypeDef>,
    changes: &mut Vec<SchemaChange>,
) {
    for (name, old_type) in old {
        let Some(new_type) = new.get(name) else {
            changes.push(SchemaChange::new(
                ChangeKind::TypeRemoved,
                Criticality::Breaking,
                format!("Type '{}' was removed", name),
                Some(name),
            ));
            continue;
        };

        if old_type.kind != new_type.kind {
            changes.push(SchemaChange::new(
                ChangeKind::TypeKindChanged,
                Criticality::Breaking,
                format!(
                    "'{}' kind changed from '{}' to '{}'",
                    name,
                    old_type.kind.as_str(),
                    new_type.kind.as_str()
                ),
                Some(name),
            ));
            continue;
        }

        if old_type.description != new_type.description {
            changes.push(SchemaChange::new(
                ChangeKind::TypeDescriptionChanged,
                Criticality::Safe,
                format!(
                    "Description '{}' on type '{}' has changed to '{}'",
                    old_type.description.as_deref().unwrap_or(""),
                    name,
                    new_type.description.as_deref().unwrap_or("")
                ),
                Some(name),
            ));
        }

        match old_type.kind {
            TypeKind::Object | TypeKind::Interface => {
                detect_interface_changes(name, &old_type.interfaces, &new_type.interfaces, changes);
                detect_field_changes(name, old_type.kind, &old_type.fields, &new_type.fields, changes);
            }
            TypeKind::InputObject => {
                detect_input_field_changes(name, &old_type.input_fields, &new_type.input_fields, changes);
            }
            TypeKind::Enum => detect_enum_changes(name, old_type, new_type, changes),
            TypeKind::Union => detect_union_changes(name, &old_type.members, &new_type.members, changes),
            TypeKind::Scalar => {}
        }
    }

    for name in new.keys().filter(|n| !old.contains_key(*n)) {
        changes.push(SchemaChange::new(
            ChangeKind::TypeAdded,
            Criticality::Safe,
            format!("Type '{}' was added", name),
            Some(name),
        ));
    }
}

fn detect_interface_changes(
    type_name: &str,
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
    changes: &mut Vec<SchemaChange>,
) {
    for removed in old.difference(new) {
        changes.push(SchemaChange::new(
            ChangeKind::ObjectTypeInterfaceRemoved,
            Criticality::Breaking,
            format!("'{}' object type no longer implements '{}' interface", type_name, removed),
            Some(type_name),
        ));
    }
    for added in new.difference(old) {
        changes.push(SchemaChange::new(
            ChangeKind::ObjectTypeInterfaceAdded,
            Criticality::Dangerous,
            format!("'{}' object implements '{}' interface", type_name, added),
            Some(type_name),
        ));
    }
}

fn detect_field_changes(
    type_name: &str,
    kind: TypeKind,
    old: &BTreeMap<String, FieldDef>,
    new: &BTreeMap<String, FieldDef>,
    changes: &mut Vec<SchemaChange>,
) {
    let owner = if kind == TypeKind::Interface {
        "interface"
    } else {
        "object"
    };

    for (field_name, old_field) in old {
        let coordinate = format!("{}.{}", type_name, field_name);
        let Some(new_field) = new.get(field_name) else {
            let deprecated = if old_field.deprecation.is_some() {
                " (deprecated)"
            } else {
                ""
            };
            changes.push(SchemaChange::new(
                ChangeKind::FieldRemoved,
                Criticality::Breaking,
                format!(
                    "Field '{}'{} was removed from {} type '{}'",
                    field_name, deprecated, owner, type_name
                ),
                Some(&coordinate),
            ));
            continue;
        };

        if old_field.ty != new_field.ty {
            let criticality = if old_field.ty.is_safe_output_change(&new_field.ty) {
                Criticality::Safe
            } else {
                Criticality::Breaking
            };
            changes.push(SchemaChange::new(
                ChangeKind::FieldTypeChanged,
                criticality,
                format!(
                    "Field '{}' changed type from '{}' to '{}'",
                    coordinate, old_field.ty, new_field.ty
                ),
                Some(&coordinate),
            ));
        }

        if old_field.description != new_field.description {
            changes.push(SchemaChange::new(
                ChangeKind::FieldDescriptionChanged,
                Criticality::Safe,
                format!("Field '{}' description changed", coordinate),
                Some(&coordinate),
            ));
        }

        match (&old_field.deprecation, &new_field.deprecation) {
            (None, Some(_)) => changes.push(SchemaChange::new(
                ChangeKind::FieldDeprecationAdded,
                Criticality::Safe,
                format!("Field '{}' is deprecated", coordinate),
                Some(&coordinate),
            )),
            (Some(_), None) => changes.push(SchemaChange::new(
                ChangeKind::FieldDeprecationRemoved,
                Criticality::Safe,
                format!("Field '{}' is no longer deprecated", coordinate),
                Some(&coordinate),
            )),
            (Some(old_reason), Some(new_reason)) if old_reason != new_reason => {
                changes.push(SchemaChange::new(
                    ChangeKind::FieldDeprecationReasonChanged,
                    Criticality::Safe,
                    format!(
                        "Deprecation reason on field '{}' has changed from '{}' to '{}'",
                        coordinate, old_reason, new_reason
                    ),
                    Some(&coordinate),
                ))
            }
            _ => {}
        }

        detect_argument_changes(&coordinate, &old_field.args, &new_field.args, changes);
    }

    for field_name in new.keys().filter(|n| !old.contains_key(*n)) {
        changes.push(SchemaChange::new(
            ChangeKind::FieldAdded,
            Criticality::Safe,
            format!("Field '{}' was added to {} type '{}'", field_name, owner, type_name),
            Some(&format!("{}.{}", type_name, field_name)),
        ));
    }
}

fn detect_argument_changes(
    field: &str,
    old: &BTreeMap<String, InputValueDef>,
    new: &BTreeMap<String, InputValueDef>,
    changes: &mut Vec<SchemaChange>,
) {
    for (arg_name, old_arg) in old {
        let coordinate = format!("{}.{}", field, arg_name);
        let Some(new_arg) = new.get(arg_name) else {
            changes.push(SchemaChange::new(
                ChangeKind::FieldArgumentRemoved,
                Criticality::Breaking,
                format!(
                    "Argument '{}: {}' was removed from field '{}'",
                    arg_name, old_arg.ty, field
                ),
                Some(&coordinate),
            ));
            continue;
        };

        if old_arg.ty != new_arg.ty {
            let criticality = if old_arg.ty.is_safe_input_change(&new_arg.ty) {
                Criticality::Safe
            } else {
                Criticality::Breaking
            };
            changes.push(SchemaChange::new(
                ChangeKind::FieldArgumentTypeChanged,
                criticality,
                format!(
                    "Type for argument '{}' on field '{}' changed from '{}' to '{}'",
                    arg_name, field, old_arg.ty, new_arg.ty
                ),
                Some(&coordinate),
            ));
        }

        if old_arg.default_value != new_arg.default_value {
            let message = match (&old_arg.default_value, &new_arg.default_value) {
                (None, Some(added)) => format!(
                    "Default value '{}' was added to argument '{}' on field '{}'",
                    added, arg_name, field
                ),
                (Some(removed), None) => format!(
                    "Default value '{}' was removed from argument '{}' on field '{}'",
                    removed, arg_name, field
                ),
                (old_default, new_default) => format!(
                    "Default value for argument '{}' on field '{}' changed from '{}' to '{}'",
                    arg_name,
                    field,
                    old_default.as_deref().unwrap_or(""),
                    new_default.as_deref().unwrap_or("")
                ),
            };
            changes.push(SchemaChange::new(
                ChangeKind::FieldArgumentDefaultChanged,
                Criticality::Dangerous,
                message,
                Some(&coordinate),
            ));
        }

        if old_arg.description != new_arg.description {
            changes.push(SchemaChange::new(
                ChangeKind::FieldArgumentDescriptionChanged,
                Criticality::Safe,
                format!("Description for argument '{}' on field '{}' changed", arg_name, field),
                Some(&coordinate),
            ));
        }
    }

    for (arg_name, new_arg) in new.iter().filter(|(n, _)| !old.contains_key(*n)) {
        let criticality = if new_arg.is_required() {
            Criticality::Breaking
        } else {
            Criticality::Safe
        };
        changes.push(SchemaChange::new(
            ChangeKind::FieldArgumentAdded,
            criticality,
            format!("Argument '{}: {}' added to field '{}'", arg_name, new_arg.ty, field),
            Some(&format!("{}.{}", field, arg_name)),
        ));
    }
}

fn detect_input_field_changes(
    type_name: &str,
    old: &BTreeMap<String, InputValueDef>,
    new: &BTreeMap<String, InputValueDef>,
    changes: &mut Vec<SchemaChange>,
) {
    for (field_name, old_field) in old {
        let coordinate = format!("{}.{}", type_name, field_name);
        let Some(new_field) = new.get(field_name) else {
            changes.push(SchemaChange::new(
                ChangeKind::InputFieldRemoved,
                Criticality::Breaking,
                format!(
                    "Input field '{}' was removed from input object type '{}'",
                    field_name, type_name
                ),
                Some(&coordinate),
            ));
            continue;
        };

        if old_field.ty != new_field.ty {
            let criticality = if old_field.ty.is_safe_input_change(&new_field.ty) {
                Criticality::Safe
            } else {
                Criticality::Breaking
            };
            changes.push(SchemaChange::new(
                ChangeKind::InputFieldTypeChanged,
                criticality,
                format!(
                    "Input field '{}' changed type from '{}' to '{}'",
                    coordinate, old_field.ty, new_field.ty
                ),
                Some(&coordinate),
            ));
        }

        if old_field.default_value != new_field.default_value {
            changes.push(SchemaChange::new(
                ChangeKind::InputFieldDefaultValueChanged,
                Criticality::Dangerous,
                format!(
                    "Input field '{}' default value changed from '{}' to '{}'",
                    coordinate,
                    old_field.default_value.as_deref().unwrap_or("undefined"),
                    new_field.default_value.as_deref().unwrap_or("undefined")
                ),
                Some(&coordinate),
            ));
        }

        if old_field.description != new_field.description {
            changes.push(SchemaChange::new(
                ChangeKind::InputFieldDescriptionChanged,
                Criticality::Safe,
                format!("Input field '{}' description changed", coordinate),
                Some(&coordinate),
            ));
        }
    }

    for (field_name, new_field) in new.iter().filter(|(n, _)| !old.contains_key(*n)) {
        let criticality = if new_field.is_required() {
            Criticality::Breaking
        } else {
            Criticality::Dangerous
        };
        changes.push(SchemaChange::new(
            ChangeKind::InputFieldAdded,
            criticality,
            format!(
                "Input field '{}' of type '{}' was added to input object type '{}'",
                field_name, new_field.ty, type_name
            ),
            Some(&format!("{}.{}", type_name, field_name)),
        ));
    }
}

fn detect_enum_changes(
    enum_name: &str,
    old: &TypeDef,
    new: &TypeDef,
    changes: &mut Vec<SchemaChange>,
) {
    for (value, old_value) in &old.values {
        let coordinate = format!("{}.{}", enum_name, value);
        let Some(new_value) = new.values.get(value) else {
            changes.push(SchemaChange::new(
                ChangeKind::EnumValueRemoved,
                Criticality::Breaking,
                format!("Enum value '{}' was removed from enum '{}'", value, enum_name),
                Some(&coordinate),
            ));
            continue;
        };

        if old_value.description != new_value.description {
            changes.push(SchemaChange::new(
                ChangeKind::EnumValueDescriptionChanged,
                Criticality::Safe,
                format!("Description for enum value '{}' changed", coordinate),
                Some(&coordinate),
            ));
        }

        match (&old_value.deprecation, &new_value.deprecation) {
            (None, Some(reason)) => changes.push(SchemaChange::new(
                ChangeKind::EnumValueDeprecationAdded,
                Criticality::Safe,
                format!("Enum value '{}' was deprecated with reason '{}'", coordinate, reason),
                Some(&coordinate),
            )),
            (Some(_), None) => changes.push(SchemaChange::new(
                ChangeKind::EnumValueDeprecationRemoved,
                Criticality::Safe,
                format!("Enum value '{}' is no longer deprecated", coordinate),
                Some(&coordinate),
            )),
            _ => {}
        }
    }

    for value in new.values.keys().filter(|v| !old.values.contains_key(*v)) {
        changes.push(SchemaChange::new(
            ChangeKind::EnumValueAdded,
            Criticality::Dangerous,
            format!("Enum value '{}' was added to enum '{}'", value, enum_name),
            Some(&format!("{}.{}", enum_name, value)),
        ));
    }
}

fn detect_union_changes(
    union_name: &str,
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
    changes: &mut Vec<SchemaChange>,
) {
    for removed in old.difference(new) {
        changes.push(SchemaChange::new(
            ChangeKind::UnionMemberRemoved,
            Criticality::Breaking,
            format!("Member '{}' was removed from Union type '{}'", removed, union_name),
            Some(union_name),
        ));
    }
    for added in new.difference(old) {
        changes.push(SchemaChange::new(
            ChangeKind::UnionMemberAdded,
            Criticality::Dangerous,
            format!("Member '{}' was added to Union type '{}'", added, union_name),
            Some(union_name),
        ));
    }
}

fn detect_directive_changes(
    old: &BTreeMap<String, DirectiveDef>,
    new: &BTreeMap<String, DirectiveDef>,
    changes: &mut Vec<SchemaChange>,
) {
    for (name, old_directive) in old {
        let path = format!("@{}", name);
        let Some(new_directive) = new.get(name) else {
            changes.push(SchemaChange::new(
                ChangeKind::DirectiveRemoved,
                Criticality::Breaking,
                format!("Directive '{}' was removed", name),
                Some(&path),
            ));
            continue;
        };

        for (arg_name, _) in old_directive
            .args
            .iter()
            .filter(|(n, _)| !new_directive.args.contains_key(*n))
        {
            changes.push(SchemaChange::new(
                ChangeKind::DirectiveArgumentRemoved,
                Criticality::Breaking,
                format!("Argument '{}' was removed from directive '{}'", arg_name, name),
                Some(&format!("{}.{}", path, arg_name)),
            ));
        }
        for (arg_name, arg) in new_directive
            .args
            .iter()
            .filter(|(n, _)| !old_directive.args.contains_key(*n))
        {
            let criticality = if arg.is_required() {
                Criticality::Breaking
            } else {
                Criticality::Safe
            };
            changes.push(SchemaChange::new(
                ChangeKind::DirectiveArgumentAdded,
                criticality,
                format!("Argument '{}' was added to directive '{}'", arg_name, name),
                Some(&format!("{}.{}", path, arg_name)),
            ));
        }

        for location in old_directive.locations.difference(&new_directive.locations) {
            changes.push(SchemaChange::new(
                ChangeKind::DirectiveLocationRemoved,
                Criticality::Breaking,
                format!("Location '{}' was removed from directive '{}'", location, name),
                Some(&path),
            ));
        }
        for location in new_directive.locations.difference(&old_directive.locations) {
            changes.push(SchemaChange::new(
                ChangeKind::DirectiveLocationAdded,
                Criticality::Safe,
                format!("Location '{}' was added to directive '{}'", location, name),
                Some(&path),
            ));
        }
    }

    for name in new.keys().filter(|n| !old.contains_key(*n)) {
        changes.push(SchemaChange::new(
            ChangeKind::DirectiveAdded,
            Criticality::Safe,
            format!("Directive '{}' was added", name),
            Some(&format!("@{}", name)),
        ));
    }
}
