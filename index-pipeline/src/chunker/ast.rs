//! Tree-sitter parsing shared by the chunker and the graph builder.
//!
//! One parse per file produces the declaration list both consumers need: the
//! chunker cuts chunks at declaration and statement boundaries, the graph
//! builder turns the same declarations into entities and edges.

use tree_sitter::{Language, Node, Parser};

use common::storage::types::code_entity::EntityKind;

#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub qualified_name: String,
    pub kind: EntityKind,
    /// 1-based, inclusive.
    pub start_line: u32,
    pub end_line: u32,
    /// Qualified name of the containing declaration, if nested.
    pub parent: Option<String>,
    /// Base classes / embedded types, unresolved names.
    pub bases: Vec<String>,
    /// Callee names referenced inside the body, unresolved.
    pub calls: Vec<String>,
    /// 1-based start lines of the body's direct statements, for splitting
    /// oversized declarations.
    pub statement_starts: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub module_name: String,
    pub declarations: Vec<Declaration>,
    /// Imported module/identifier names, unresolved.
    pub imports: Vec<String>,
    /// Inclusive line span of the leading import block, if any.
    pub preamble: Option<(u32, u32)>,
}

pub fn supports(language: &str) -> bool {
    grammar_for(language).is_some()
}

fn grammar_for(language: &str) -> Option<Language> {
    match language {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        _ => None,
    }
}

/// Parse a file into declarations and imports. Returns `None` when the
/// language has no grammar or the parse fails outright.
pub fn parse_source(language: &str, module_name: &str, content: &str) -> Option<ParsedSource> {
    let grammar = grammar_for(language)?;
    let mut parser = Parser::new();
    parser.set_language(&grammar).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();
    if root.has_error() && root.named_child_count() == 0 {
        return None;
    }

    let source = content.as_bytes();
    let mut parsed = ParsedSource {
        module_name: module_name.to_owned(),
        declarations: Vec::new(),
        imports: Vec::new(),
        preamble: None,
    };

    extract_top_level(root, source, language, module_name, &mut parsed);
    parsed.preamble = leading_import_span(root, language);

    Some(parsed)
}

fn is_import_kind(language: &str, kind: &str) -> bool {
    match language {
        "rust" => kind == "use_declaration" || kind == "extern_crate_declaration",
        "python" => kind == "import_statement" || kind == "import_from_statement",
        "typescript" | "javascript" => kind == "import_statement",
        "go" => kind == "import_declaration",
        _ => false,
    }
}

fn extract_top_level(
    root: Node,
    source: &[u8],
    language: &str,
    module_name: &str,
    parsed: &mut ParsedSource,
) {
    for i in 0..root.named_child_count() {
        let Some(node) = root.named_child(i) else {
            continue;
        };
        let kind = node.kind();

        if is_import_kind(language, kind) {
            collect_imports(node, source, language, &mut parsed.imports);
            continue;
        }

        match (language, kind) {
            ("rust", "function_item")
            | ("python", "function_definition")
            | ("typescript" | "javascript", "function_declaration")
            | ("go", "function_declaration") => {
                push_function(node, source, language, module_name, None, parsed);
            }
            ("python", "decorated_definition") => {
                if let Some(inner) = node.child_by_field_name("definition") {
                    match inner.kind() {
                        "function_definition" => {
                            push_function(inner, source, language, module_name, None, parsed);
                        }
                        "class_definition" => {
                            push_class(inner, source, language, module_name, parsed);
                        }
                        _ => {}
                    }
                }
            }
            ("rust", "struct_item" | "enum_item" | "trait_item")
            | ("python", "class_definition")
            | ("typescript" | "javascript", "class_declaration") => {
                push_class(node, source, language, module_name, parsed);
            }
            ("rust", "impl_item") => {
                push_rust_impl(node, source, module_name, parsed);
            }
            ("rust", "const_item" | "static_item") => {
                if let Some(name) = field_text(node, "name", source) {
                    parsed.declarations.push(plain_decl(
                        node,
                        name.clone(),
                        format!("{module_name}::{name}"),
                        EntityKind::Variable,
                        None,
                        source,
                    ));
                }
            }
            ("go", "method_declaration") => {
                let receiver = go_receiver_type(node, source);
                let parent = receiver
                    .as_ref()
                    .map(|recv| format!("{module_name}::{recv}"));
                push_function(node, source, language, module_name, parent, parsed);
            }
            ("go", "type_declaration") => {
                for j in 0..node.named_child_count() {
                    let Some(spec) = node.named_child(j) else {
                        continue;
                    };
                    if spec.kind() == "type_spec" {
                        if let Some(name) = field_text(spec, "name", source) {
                            parsed.declarations.push(plain_decl(
                                node,
                                name.clone(),
                                format!("{module_name}::{name}"),
                                EntityKind::Class,
                                None,
                                source,
                            ));
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn push_function(
    node: Node,
    source: &[u8],
    language: &str,
    module_name: &str,
    parent: Option<String>,
    parsed: &mut ParsedSource,
) {
    let Some(name) = field_text(node, "name", source) else {
        return;
    };
    let qualified = match &parent {
        Some(parent_qn) => format!("{parent_qn}::{name}"),
        None => format!("{module_name}::{name}"),
    };
    let kind = if parent.is_some() {
        EntityKind::Method
    } else {
        EntityKind::Function
    };

    let mut decl = plain_decl(node, name, qualified, kind, parent, source);
    decl.calls = collect_calls(node, source, language);
    decl.statement_starts = body_statement_starts(node);
    parsed.declarations.push(decl);
}

fn push_class(
    node: Node,
    source: &[u8],
    language: &str,
    module_name: &str,
    parsed: &mut ParsedSource,
) {
    let Some(name) = field_text(node, "name", source) else {
        return;
    };
    let qualified = format!("{module_name}::{name}");

    let mut decl = plain_decl(node, name, qualified.clone(), EntityKind::Class, None, source);
    decl.bases = class_bases(node, source, language);
    decl.statement_starts = body_statement_starts(node);
    parsed.declarations.push(decl);

    // Methods declared in the class body.
    if let Some(body) = node.child_by_field_name("body") {
        for i in 0..body.named_child_count() {
            let Some(member) = body.named_child(i) else {
                continue;
            };
            let member = if member.kind() == "decorated_definition" {
                member.child_by_field_name("definition").unwrap_or(member)
            } else {
                member
            };
            let is_method = matches!(
                member.kind(),
                "function_definition" | "method_definition" | "function_declaration"
            );
            if is_method {
                push_function(
                    member,
                    source,
                    language,
                    module_name,
                    Some(qualified.clone()),
                    parsed,
                );
            }
        }
    }
}

fn push_rust_impl(node: Node, source: &[u8], module_name: &str, parsed: &mut ParsedSource) {
    let Some(type_name) = field_text(node, "type", source) else {
        return;
    };
    let type_name = last_identifier(&type_name);
    let parent_qn = format!("{module_name}::{type_name}");

    // Trait impls also produce an inherits edge from the type to the trait.
    if let Some(trait_name) = field_text(node, "trait", source) {
        if let Some(class_decl) = parsed
            .declarations
            .iter_mut()
            .find(|d| d.qualified_name == parent_qn)
        {
            class_decl.bases.push(last_identifier(&trait_name));
        }
    }

    if let Some(body) = node.child_by_field_name("body") {
        for i in 0..body.named_child_count() {
            let Some(member) = body.named_child(i) else {
                continue;
            };
            if member.kind() == "function_item" {
                push_function(
                    member,
                    source,
                    "rust",
                    module_name,
                    Some(parent_qn.clone()),
                    parsed,
                );
            }
        }
    }
}

fn plain_decl(
    node: Node,
    name: String,
    qualified_name: String,
    kind: EntityKind,
    parent: Option<String>,
    _source: &[u8],
) -> Declaration {
    Declaration {
        name,
        qualified_name,
        kind,
        start_line: node.start_position().row as u32 + 1,
        end_line: node.end_position().row as u32 + 1,
        parent,
        bases: Vec::new(),
        calls: Vec::new(),
        statement_starts: Vec::new(),
    }
}

fn class_bases(node: Node, source: &[u8], language: &str) -> Vec<String> {
    let mut bases = Vec::new();
    match language {
        "python" => {
            if let Some(superclasses) = node.child_by_field_name("superclasses") {
                for i in 0..superclasses.named_child_count() {
                    if let Some(base) = superclasses.named_child(i) {
                        if let Ok(text) = base.utf8_text(source) {
                            bases.push(last_identifier(text));
                        }
                    }
                }
            }
        }
        "typescript" | "javascript" => {
            // class X extends Y { ... }: the heritage clause is a plain child.
            for i in 0..node.child_count() {
                if let Some(child) = node.child(i) {
                    if child.kind() == "class_heritage" {
                        if let Ok(text) = child.utf8_text(source) {
                            let cleaned = text
                                .trim_start_matches("extends")
                                .trim_start_matches("implements")
                                .trim();
                            if !cleaned.is_empty() {
                                bases.push(last_identifier(cleaned));
                            }
                        }
                    }
                }
            }
        }
        _ => {}
    }
    bases
}

fn go_receiver_type(node: Node, source: &[u8]) -> Option<String> {
    let receiver = node.child_by_field_name("receiver")?;
    let text = receiver.utf8_text(source).ok()?;
    let cleaned = text.trim_matches(|c| c == '(' || c == ')');
    let type_part = cleaned.split_whitespace().last()?;
    Some(last_identifier(type_part.trim_start_matches('*')))
}

/// Callee names referenced within a declaration body.
fn collect_calls(node: Node, source: &[u8], language: &str) -> Vec<String> {
    let call_kind = match language {
        "python" => "call",
        _ => "call_expression",
    };

    let mut calls = Vec::new();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if current.kind() == call_kind {
            if let Some(function) = current.child_by_field_name("function") {
                if let Ok(text) = function.utf8_text(source) {
                    let callee = last_identifier(text);
                    if !callee.is_empty() {
                        calls.push(callee);
                    }
                }
            }
        }
        for i in 0..current.named_child_count() {
            if let Some(child) = current.named_child(i) {
                stack.push(child);
            }
        }
    }
    calls.sort();
    calls.dedup();
    calls
}

fn body_statement_starts(node: Node) -> Vec<u32> {
    let Some(body) = node.child_by_field_name("body") else {
        return Vec::new();
    };
    let mut starts = Vec::new();
    for i in 0..body.named_child_count() {
        if let Some(statement) = body.named_child(i) {
            starts.push(statement.start_position().row as u32 + 1);
        }
    }
    starts.dedup();
    starts
}

fn collect_imports(node: Node, source: &[u8], language: &str, imports: &mut Vec<String>) {
    match language {
        "rust" => {
            if let Ok(text) = node.utf8_text(source) {
                let cleaned = text
                    .trim_start_matches("pub")
                    .trim()
                    .trim_start_matches("use")
                    .trim()
                    .trim_end_matches(';');
                if let Some(root_segment) = cleaned.split("::").next() {
                    let root_segment = root_segment.trim();
                    if !root_segment.is_empty() {
                        imports.push(root_segment.to_owned());
                    }
                }
            }
        }
        "python" => {
            if let Some(module) = node
                .child_by_field_name("module_name")
                .or_else(|| node.child_by_field_name("name"))
            {
                if let Ok(text) = module.utf8_text(source) {
                    if let Some(root_segment) = text.split('.').next() {
                        imports.push(root_segment.to_owned());
                    }
                }
            } else {
                for i in 0..node.named_child_count() {
                    if let Some(child) = node.named_child(i) {
                        if child.kind() == "dotted_name" || child.kind() == "aliased_import" {
                            if let Ok(text) = child.utf8_text(source) {
                                if let Some(root_segment) = text.split('.').next() {
                                    imports.push(root_segment.trim().to_owned());
                                }
                            }
                        }
                    }
                }
            }
        }
        "typescript" | "javascript" => {
            if let Some(source_node) = node.child_by_field_name("source") {
                if let Ok(text) = source_node.utf8_text(source) {
                    let cleaned = text.trim_matches(|c| c == '"' || c == '\'');
                    let name = cleaned
                        .rsplit('/')
                        .next()
                        .unwrap_or(cleaned)
                        .trim_start_matches("./");
                    if !name.is_empty() {
                        imports.push(name.to_owned());
                    }
                }
            }
        }
        "go" => {
            let mut stack = vec![node];
            while let Some(current) = stack.pop() {
                if current.kind() == "interpreted_string_literal" {
                    if let Ok(text) = current.utf8_text(source) {
                        let cleaned = text.trim_matches('"');
                        if let Some(name) = cleaned.rsplit('/').next() {
                            imports.push(name.to_owned());
                        }
                    }
                }
                for i in 0..current.named_child_count() {
                    if let Some(child) = current.named_child(i) {
                        stack.push(child);
                    }
                }
            }
        }
        _ => {}
    }
}

fn leading_import_span(root: Node, language: &str) -> Option<(u32, u32)> {
    let mut span: Option<(u32, u32)> = None;
    for i in 0..root.named_child_count() {
        let Some(node) = root.named_child(i) else {
            continue;
        };
        let kind = node.kind();
        if kind == "comment" || kind == "line_comment" || kind == "block_comment" {
            continue;
        }
        if is_import_kind(language, kind) || (language == "rust" && kind == "attribute_item") {
            let start = node.start_position().row as u32 + 1;
            let end = node.end_position().row as u32 + 1;
            span = Some(match span {
                Some((s, _)) => (s, end),
                None => (start, end),
            });
        } else {
            break;
        }
    }
    span
}

fn field_text(node: Node, field: &str, source: &[u8]) -> Option<String> {
    let child = node.child_by_field_name(field)?;
    child.utf8_text(source).ok().map(str::to_owned)
}

/// "a::b::c" -> "c", "a.b.c" -> "c"; also strips generics and call parens.
fn last_identifier(text: &str) -> String {
    let trimmed = text
        .split('<')
        .next()
        .unwrap_or(text)
        .split('(')
        .next()
        .unwrap_or(text);
    let last = trimmed
        .rsplit("::")
        .next()
        .unwrap_or(trimmed)
        .rsplit('.')
        .next()
        .unwrap_or(trimmed);
    last.trim().to_owned()
}
