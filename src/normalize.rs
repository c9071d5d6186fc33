//! Operation normalization
//!
//! Turns an executed operation document into its canonical body and
//! fingerprint. The canonical body:
//!
//! - keeps only the selected operation and the fragments it reaches
//! - optionally hides literal values (`hide_literals`) and response aliases
//!   (`remove_aliases`)
//! - sorts arguments, variables, directives and selections
//! - is printed without ignored characters (`query ping {  ping }` becomes
//!   `query ping{ping}`)
//!
//! Parsing is delegated to `graphql-parser`; everything here is a transform
//! over its tree.

use std::collections::{BTreeMap, BTreeSet};

use graphql_parser::query::{
    parse_query, Definition, Directive, Document, Field, FragmentDefinition, OperationDefinition,
    Selection, SelectionSet, Type, TypeCondition, Value, VariableDefinition,
};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::fingerprint::OperationHash;
use crate::usage::OperationKind;

/// Flags controlling how much of an operation survives normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Replace Int/Float/String literals with placeholders
    #[serde(default = "default_true")]
    pub hide_literals: bool,
    /// Strip response aliases
    #[serde(default = "default_true")]
    pub remove_aliases: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            hide_literals: true,
            remove_aliases: true,
        }
    }
}

/// A canonicalized operation and its fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedOperation {
    pub body: String,
    pub kind: OperationKind,
    pub name: Option<String>,
    /// Sorted, deduplicated coordinates
    pub coordinates: Vec<String>,
    pub hash: OperationHash,
}

/// Canonicalizes operation documents
#[derive(Debug, Clone, Default)]
pub struct OperationNormalizer {
    options: NormalizeOptions,
}

impl OperationNormalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> NormalizeOptions {
        self.options
    }

    /// Parse, canonicalize and fingerprint an operation document
    pub fn normalize<S: AsRef<str>>(
        &self,
        document: &str,
        operation_name: Option<&str>,
        coordinates: &[S],
    ) -> Result<NormalizedOperation> {
        let parsed = parse_query::<&str>(document)
            .map_err(|e| RegistryError::InvalidOperation(e.to_string()))?;
        self.normalize_document(&parsed, operation_name, coordinates)
    }

    /// Canonicalize and fingerprint an already parsed document
    pub fn normalize_document<'a, S: AsRef<str>>(
        &self,
        document: &Document<'a, &'a str>,
        operation_name: Option<&str>,
        coordinates: &[S],
    ) -> Result<NormalizedOperation> {
        let operation = select_operation(document, operation_name)?;
        let parts = OperationParts::of(operation);
        let fragments = reachable_fragments(document, parts.selection_set)?;

        let printer = Printer { options: &self.options };
        let mut out = TokenStream::default();
        printer.operation(&parts, &mut out);
        for fragment in fragments.values() {
            printer.fragment(fragment, &mut out);
        }
        let body = out.render();

        let name = operation_name
            .map(String::from)
            .or_else(|| parts.name.map(String::from));
        let coordinates: Vec<String> = coordinates
            .iter()
            .map(|c| c.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let hash = OperationHash::compute(&body, parts.kind, &coordinates, name.as_deref());

        Ok(NormalizedOperation {
            body,
            kind: parts.kind,
            name,
            coordinates,
            hash,
        })
    }
}

/// The pieces of an operation definition, regardless of its kind
struct OperationParts<'d, 'a> {
    kind: OperationKind,
    name: Option<&'a str>,
    variables: &'d [VariableDefinition<'a, &'a str>],
    directives: &'d [Directive<'a, &'a str>],
    selection_set: &'d SelectionSet<'a, &'a str>,
}

impl<'d, 'a> OperationParts<'d, 'a> {
    fn of(operation: &'d OperationDefinition<'a, &'a str>) -> Self {
        match operation {
            OperationDefinition::SelectionSet(set) => Self {
                kind: OperationKind::Query,
                name: None,
                variables: &[],
                directives: &[],
                selection_set: set,
            },
            OperationDefinition::Query(q) => Self {
                kind: OperationKind::Query,
                name: q.name,
                variables: &q.variable_definitions,
                directives: &q.directives,
                selection_set: &q.selection_set,
            },
            OperationDefinition::Mutation(m) => Self {
                kind: OperationKind::Mutation,
                name: m.name,
                variables: &m.variable_definitions,
                directives: &m.directives,
                selection_set: &m.selection_set,
            },
            OperationDefinition::Subscription(s) => Self {
                kind: OperationKind::Subscription,
                name: s.name,
                variables: &s.variable_definitions,
                directives: &s.directives,
                selection_set: &s.selection_set,
            },
        }
    }
}

fn operation_name_of<'a>(operation: &OperationDefinition<'a, &'a str>) -> Option<&'a str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name,
        OperationDefinition::Mutation(m) => m.name,
        OperationDefinition::Subscription(s) => s.name,
    }
}

/// Pick the operation named `operation_name`, falling back to the only one
fn select_operation<'d, 'a>(
    document: &'d Document<'a, &'a str>,
    operation_name: Option<&str>,
) -> Result<&'d OperationDefinition<'a, &'a str>> {
    let operations: Vec<_> = document
        .definitions
        .iter()
        .filter_map(|d| match d {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
        .collect();

    if operations.is_empty() {
        return Err(RegistryError::InvalidOperation(
            "document contains no operation".to_string(),
        ));
    }

    if let Some(wanted) = operation_name {
        if let Some(op) = operations
            .iter()
            .copied()
            .find(|op| operation_name_of(op) == Some(wanted))
        {
            return Ok(op);
        }
    }

    match operations.as_slice() {
        [only] => Ok(*only),
        _ => Err(RegistryError::InvalidOperation(format!(
            "cannot select operation {:?} among {} operations",
            operation_name.unwrap_or("<anonymous>"),
            operations.len()
        ))),
    }
}

/// Fragments transitively spread by the selection set, keyed (and so sorted) by name
fn reachable_fragments<'d, 'a>(
    document: &'d Document<'a, &'a str>,
    root: &'d SelectionSet<'a, &'a str>,
) -> Result<BTreeMap<&'a str, &'d FragmentDefinition<'a, &'a str>>> {
    let definitions: BTreeMap<&'a str, &'d FragmentDefinition<'a, &'a str>> = document
        .definitions
        .iter()
        .filter_map(|d| match d {
            Definition::Fragment(f) => Some((f.name, f)),
            Definition::Operation(_) => None,
        })
        .collect();

    let mut reached = BTreeMap::new();
    let mut pending = Vec::new();
    collect_spreads(root, &mut pending);

    while let Some(name) = pending.pop() {
        if reached.contains_key(name) {
            continue;
        }
        let fragment = definitions.get(name).ok_or_else(|| {
            RegistryError::InvalidOperation(format!("unknown fragment \"{}\"", name))
        })?;
        reached.insert(name, *fragment);
        collect_spreads(&fragment.selection_set, &mut pending);
    }

    Ok(reached)
}

fn collect_spreads<'a>(set: &SelectionSet<'a, &'a str>, found: &mut Vec<&'a str>) {
    for item in &set.items {
        match item {
            Selection::Field(field) => collect_spreads(&field.selection_set, found),
            Selection::FragmentSpread(spread) => found.push(spread.fragment_name),
            Selection::InlineFragment(inline) => collect_spreads(&inline.selection_set, found),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    text: String,
    /// Names, keywords, numbers and strings need a separator between each other
    word: bool,
}

#[derive(Debug, Default)]
struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    fn word(&mut self, text: impl Into<String>) {
        self.tokens.push(Token {
            text: text.into(),
            word: true,
        });
    }

    fn punct(&mut self, text: &str) {
        self.tokens.push(Token {
            text: text.to_string(),
            word: false,
        });
    }

    fn append(&mut self, other: TokenStream) {
        self.tokens.extend(other.tokens);
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let mut last_was_word = false;
        for token in &self.tokens {
            if last_was_word && token.word {
                out.push(' ');
            }
            out.push_str(&token.text);
            last_was_word = token.word;
        }
        out
    }
}

struct Printer<'o> {
    options: &'o NormalizeOptions,
}

impl Printer<'_> {
    fn operation(&self, parts: &OperationParts<'_, '_>, out: &mut TokenStream) {
        let shorthand = parts.kind == OperationKind::Query
            && parts.name.is_none()
            && parts.variables.is_empty()
            && parts.directives.is_empty();

        if !shorthand {
            out.word(parts.kind.as_str());
            if let Some(name) = parts.name {
                out.word(name);
            }
            self.variables(parts.variables, out);
            self.directives(parts.directives, out);
        }
        self.selection_set(parts.selection_set, out);
    }

    fn fragment<'a>(&self, fragment: &FragmentDefinition<'a, &'a str>, out: &mut TokenStream) {
        out.word("fragment");
        out.word(fragment.name);
        let TypeCondition::On(on) = fragment.type_condition;
        out.word("on");
        out.word(on);
        self.directives(&fragment.directives, out);
        self.selection_set(&fragment.selection_set, out);
    }

    fn selection_set<'a>(&self, set: &SelectionSet<'a, &'a str>, out: &mut TokenStream) {
        let mut items: Vec<(String, TokenStream)> = set
            .items
            .iter()
            .map(|selection| {
                let mut printed = TokenStream::default();
                self.selection(selection, &mut printed);
                (printed.render(), printed)
            })
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));

        out.punct("{");
        for (_, printed) in items {
            out.append(printed);
        }
        out.punct("}");
    }

    fn selection<'a>(&self, selection: &Selection<'a, &'a str>, out: &mut TokenStream) {
        match selection {
            Selection::Field(field) => self.field(field, out),
            Selection::FragmentSpread(spread) => {
                out.punct("...");
                out.word(spread.fragment_name);
                self.directives(&spread.directives, out);
            }
            Selection::InlineFragment(inline) => {
                out.punct("...");
                if let Some(TypeCondition::On(on)) = inline.type_condition {
                    out.word("on");
                    out.word(on);
                }
                self.directives(&inline.directives, out);
                self.selection_set(&inline.selection_set, out);
            }
        }
    }

    fn field<'a>(&self, field: &Field<'a, &'a str>, out: &mut TokenStream) {
        if !self.options.remove_aliases {
            if let Some(alias) = field.alias {
                out.word(alias);
                out.punct(":");
            }
        }
        out.word(field.name);
        self.arguments(&field.arguments, out);
        self.directives(&field.directives, out);
        if !field.selection_set.items.is_empty() {
            self.selection_set(&field.selection_set, out);
        }
    }

    fn arguments<'a>(&self, arguments: &[(&'a str, Value<'a, &'a str>)], out: &mut TokenStream) {
        if arguments.is_empty() {
            return;
        }
        let mut sorted: Vec<_> = arguments.iter().collect();
        sorted.sort_by_key(|argument| argument.0);

        out.punct("(");
        for (name, value) in sorted {
            out.word(*name);
            out.punct(":");
            self.value(value, out);
        }
        out.punct(")");
    }

    fn directives<'a>(&self, directives: &[Directive<'a, &'a str>], out: &mut TokenStream) {
        let mut sorted: Vec<_> = directives.iter().collect();
        sorted.sort_by_key(|directive| directive.name);

        for directive in sorted {
            out.punct("@");
            out.word(directive.name);
            self.arguments(&directive.arguments, out);
        }
    }

    fn variables<'a>(&self, variables: &[VariableDefinition<'a, &'a str>], out: &mut TokenStream) {
        if variables.is_empty() {
            return;
        }
        let mut sorted: Vec<_> = variables.iter().collect();
        sorted.sort_by_key(|variable| variable.name);

        out.punct("(");
        for variable in sorted {
            out.punct("$");
            out.word(variable.name);
            out.punct(":");
            self.type_ref(&variable.var_type, out);
            if let Some(default) = &variable.default_value {
                out.punct("=");
                self.value(default, out);
            }
        }
        out.punct(")");
    }

    fn type_ref<'a>(&self, ty: &Type<'a, &'a str>, out: &mut TokenStream) {
        match ty {
            Type::NamedType(name) => out.word(*name),
            Type::ListType(inner) => {
                out.punct("[");
                self.type_ref(inner, out);
                out.punct("]");
            }
            Type::NonNullType(inner) => {
                self.type_ref(inner, out);
                out.punct("!");
            }
        }
    }

    fn value<'a>(&self, value: &Value<'a, &'a str>, out: &mut TokenStream) {
        let hide = self.options.hide_literals;
        match value {
            Value::Variable(name) => {
                out.punct("$");
                out.word(*name);
            }
            Value::Int(number) => match (hide, number.as_i64()) {
                (false, Some(n)) => out.word(n.to_string()),
                _ => out.word("0"),
            },
            Value::Float(float) => {
                if hide {
                    out.word("0");
                } else {
                    out.word(format!("{:?}", float));
                }
            }
            Value::String(text) => {
                if hide {
                    out.word("\"\"");
                } else {
                    out.word(quote(text));
                }
            }
            Value::Boolean(flag) => out.word(flag.to_string()),
            Value::Null => out.word("null"),
            Value::Enum(name) => out.word(*name),
            Value::List(items) => {
                out.punct("[");
                for item in items {
                    self.value(item, out);
                }
                out.punct("]");
            }
            Value::Object(fields) => {
                out.punct("{");
                for (name, field) in fields {
                    out.word(*name);
                    out.punct(":");
                    self.value(field, out);
                }
                out.punct("}");
            }
        }
    }
}

/// GraphQL string escapes are a subset of JSON's
fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}
