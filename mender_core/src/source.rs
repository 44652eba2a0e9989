use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read source file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },
}

/// A line of a source file, relative to the program's source root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Declaration,
    Return,
    Break,
    Continue,
    Expression,
}

/// A simple statement inside a function body, occupying whole lines.
#[derive(Debug, Clone)]
pub struct Statement {
    pub location: Location,
    pub last_line: u32,
    /// Source text with its lines trimmed and joined by single spaces.
    pub text: String,
    pub indent: String,
    pub kind: StatementKind,
    /// Index of the enclosing function in [`SourceFile::functions`].
    pub function: usize,
    pub declares: Vec<String>,
    /// Variables the statement reads or writes (calls, members and constants excluded).
    pub uses: BTreeSet<String>,
    /// Ids of the enclosing blocks, outermost first.
    pub blocks: Vec<u32>,
    /// Names introduced by enclosing block headers, e.g. a `for` initializer.
    pub header_names: Vec<String>,
    pub in_loop: bool,
    pub in_switch: bool,
    /// The sole, unbraced body of an `if`/`else`/loop header.
    pub braceless_body: bool,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// `None` for constructors and destructors.
    pub return_type: Option<String>,
    pub first_line: u32,
    pub last_line: u32,
    pub params: Vec<String>,
}

impl Function {
    /// The whitespace-normalized return type, `None` when nothing is returned.
    pub fn value_type(&self) -> Option<String> {
        self.return_type
            .as_deref()
            .map(normalize_whitespace)
            .filter(|ty| ty != "void")
    }

    fn class_name(&self) -> Option<&str> {
        self.name.rsplit_once("::").map(|(class, _)| class)
    }
}

/// The statement index of one source file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    path: String,
    lines: Vec<String>,
    trailing_newline: bool,
    statements: Vec<Statement>,
    by_line: HashMap<u32, usize>,
    functions: Vec<Function>,
    globals: BTreeSet<String>,
    /// Per class: names used by its methods that none of them declares.
    members: HashMap<String, BTreeSet<String>>,
}

impl SourceFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// The statement starting at `line`, if any.
    pub fn statement_at(&self, line: u32) -> Option<&Statement> {
        self.by_line.get(&line).map(|&i| &self.statements[i])
    }

    pub fn function_of(&self, statement: &Statement) -> &Function {
        &self.functions[statement.function]
    }

    /// Variables visible just before `statement`.
    pub fn visible_names(&self, statement: &Statement) -> BTreeSet<String> {
        let mut names = self.globals.clone();
        let function = self.function_of(statement);
        names.extend(function.params.iter().cloned());
        if let Some(members) = function.class_name().and_then(|c| self.members.get(c)) {
            names.extend(members.iter().cloned());
        }
        names.extend(statement.header_names.iter().cloned());
        for earlier in &self.statements {
            if earlier.location.line >= statement.location.line {
                break;
            }
            if earlier.function == statement.function && statement.blocks.starts_with(&earlier.blocks) {
                names.extend(earlier.declares.iter().cloned());
            }
        }
        names
    }

    /// Joins `lines` back into file content using this file's line ending convention.
    pub fn render(&self, lines: &[String]) -> String {
        let mut content = lines.join("\n");
        if self.trailing_newline {
            content.push('\n');
        }
        content
    }
}

/// Builds statement indexes from source text.
pub trait SourceAnalyzer: Send + Sync {
    fn analyze(&self, path: &str, content: &str) -> SourceFile;
}

/// A line-oriented analyzer for C and C++.
///
/// It recognises brace structure, function definitions and simple statements
/// without a full parse. Statements sharing a line with other code (such as
/// `if (x) y();`) and preprocessor lines are not indexed.
#[derive(Debug, Default, Clone)]
pub struct CFamilyAnalyzer;

impl SourceAnalyzer for CFamilyAnalyzer {
    fn analyze(&self, path: &str, content: &str) -> SourceFile {
        let trailing_newline = content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(content);
        let lines: Vec<String> = body
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();

        let original: Vec<Vec<char>> = lines.iter().map(|l| l.chars().collect()).collect();
        let sanitized = sanitize(&original);

        let mut walker = Walker::new(&original, &sanitized);
        walker.run();
        let Walker {
            statements,
            functions,
            globals,
            ..
        } = walker;

        let members = class_members(&statements, &functions);
        let by_line = statements
            .iter()
            .enumerate()
            .map(|(i, s)| (s.location.line, i))
            .collect();
        let statements = statements
            .into_iter()
            .map(|mut s| {
                s.location.file = path.to_string();
                s
            })
            .collect::<Vec<_>>();
        debug!(
            "analyzed {path}: {} functions, {} statements",
            functions.len(),
            statements.len()
        );

        SourceFile {
            path: path.to_string(),
            lines,
            trailing_newline,
            statements,
            by_line,
            functions,
            globals,
            members,
        }
    }
}

fn class_members(statements: &[Statement], functions: &[Function]) -> HashMap<String, BTreeSet<String>> {
    let mut declared: Vec<BTreeSet<&str>> = functions
        .iter()
        .map(|f| f.params.iter().map(String::as_str).collect())
        .collect();
    for s in statements {
        declared[s.function].extend(s.declares.iter().map(String::as_str));
        declared[s.function].extend(s.header_names.iter().map(String::as_str));
    }

    let mut members: HashMap<String, BTreeSet<String>> = HashMap::new();
    for s in statements {
        let Some(class) = functions[s.function].class_name() else {
            continue;
        };
        let entry = members.entry(class.to_string()).or_default();
        for name in &s.uses {
            if !declared[s.function].contains(name.as_str()) {
                entry.insert(name.clone());
            }
        }
    }
    members
}

/// Source files of the program, keyed by path relative to the source root.
#[derive(Debug, Clone, Default)]
pub struct SourceIndex {
    files: BTreeMap<String, SourceFile>,
}

impl SourceIndex {
    pub fn build(
        analyzer: &dyn SourceAnalyzer,
        root: &Path,
        files: impl IntoIterator<Item = String>,
    ) -> Result<Self, SourceError> {
        let mut index = BTreeMap::new();
        for file in files {
            let path = root.join(&file);
            let content = std::fs::read_to_string(&path).map_err(|e| SourceError::Io {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let analyzed = analyzer.analyze(&file, &content);
            index.insert(file, analyzed);
        }
        Ok(Self { files: index })
    }

    pub fn insert(&mut self, file: SourceFile) {
        self.files.insert(file.path.clone(), file);
    }

    pub fn get(&self, file: &str) -> Option<&SourceFile> {
        self.files.get(file)
    }

    pub fn files(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.values()
    }

    pub fn statement_at(&self, location: &Location) -> Option<(&SourceFile, &Statement)> {
        let file = self.files.get(&location.file)?;
        file.statement_at(location.line).map(|s| (file, s))
    }
}

/// Collapses whitespace, keeping a single space only between two word characters.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut gap = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            gap = true;
            continue;
        }
        if gap && out.chars().last().is_some_and(is_ident_char) && is_ident_char(ch) {
            out.push(' ');
        }
        gap = false;
        out.push(ch);
    }
    out
}

const KEYWORDS: &[&str] = &[
    "alignas", "alignof", "auto", "bool", "break", "case", "catch", "char", "class", "const",
    "const_cast", "constexpr", "continue", "default", "delete", "do", "double", "dynamic_cast",
    "else", "enum", "explicit", "extern", "false", "float", "for", "friend", "goto", "if",
    "inline", "int", "int8_t", "int16_t", "int32_t", "int64_t", "long", "mutable", "namespace",
    "new", "noexcept", "nullptr", "operator", "override", "private", "protected", "public",
    "register", "reinterpret_cast", "return", "short", "signed", "size_t", "sizeof", "static",
    "static_assert", "static_cast", "struct", "switch", "template", "this", "throw", "true",
    "try", "typedef", "typename", "uint8_t", "uint16_t", "uint32_t", "uint64_t", "union",
    "unsigned", "using", "virtual", "void", "volatile", "while",
];

const CONTROL_WORDS: &[&str] = &["if", "else", "for", "while", "do", "switch", "try", "catch"];

const NON_DECLARATION_STARTERS: &[&str] = &[
    "return", "delete", "goto", "throw", "case", "break", "continue", "new", "sizeof", "using",
    "typedef", "if", "else", "for", "while", "do", "switch",
];

const SPECIFIERS: &[&str] = &["static", "inline", "virtual", "constexpr", "explicit", "extern", "friend"];

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn first_word(text: &str) -> &str {
    let text = text.trim_start();
    let end = text.find(|c: char| !is_ident_char(c)).unwrap_or(text.len());
    &text[..end]
}

/// Blanks comments, string/char literal contents and preprocessor lines,
/// keeping every character position intact.
fn sanitize(lines: &[Vec<char>]) -> Vec<Vec<char>> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        BlockComment,
        Literal(char),
        Directive,
    }

    let mut state = State::Code;
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let mut clean = line.clone();
        if state == State::Code && line.iter().find(|c| !c.is_whitespace()) == Some(&'#') {
            state = State::Directive;
        }
        let mut i = 0;
        while i < line.len() {
            let ch = line[i];
            let next = line.get(i + 1).copied();
            match state {
                State::Directive => clean[i] = ' ',
                State::BlockComment => {
                    clean[i] = ' ';
                    if ch == '*' && next == Some('/') {
                        clean[i + 1] = ' ';
                        i += 1;
                        state = State::Code;
                    }
                }
                State::Literal(quote) => {
                    if ch == '\\' {
                        clean[i] = ' ';
                        if next.is_some() {
                            clean[i + 1] = ' ';
                        }
                        i += 1;
                    } else if ch == quote {
                        state = State::Code;
                    } else {
                        clean[i] = ' ';
                    }
                }
                State::Code => match (ch, next) {
                    ('/', Some('/')) => {
                        for c in clean.iter_mut().skip(i) {
                            *c = ' ';
                        }
                        break;
                    }
                    ('/', Some('*')) => {
                        clean[i] = ' ';
                        clean[i + 1] = ' ';
                        i += 1;
                        state = State::BlockComment;
                    }
                    ('"', _) | ('\'', _) => state = State::Literal(ch),
                    _ => {}
                },
            }
            i += 1;
        }
        match state {
            State::Directive if line.last() != Some(&'\\') => state = State::Code,
            // unterminated literals do not span lines
            State::Literal(_) => state = State::Code,
            _ => {}
        }
        out.push(clean);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Scope,
    Function(usize),
    Loop,
    Switch,
    Block,
}

#[derive(Debug)]
struct OpenBlock {
    id: u32,
    kind: BlockKind,
    declares: Vec<String>,
}

/// A control header whose body has no braces.
#[derive(Debug, Default)]
struct BracelessHeader {
    is_loop: bool,
    declares: Vec<String>,
}

struct Walker<'a> {
    original: &'a [Vec<char>],
    sanitized: &'a [Vec<char>],
    stack: Vec<OpenBlock>,
    next_block_id: u32,
    pending: String,
    start: Option<(usize, usize)>,
    depth: i32,
    header_closed: bool,
    braceless: Option<BracelessHeader>,
    statements: Vec<Statement>,
    functions: Vec<Function>,
    globals: BTreeSet<String>,
}

impl<'a> Walker<'a> {
    fn new(original: &'a [Vec<char>], sanitized: &'a [Vec<char>]) -> Self {
        Self {
            original,
            sanitized,
            stack: Vec::new(),
            next_block_id: 0,
            pending: String::new(),
            start: None,
            depth: 0,
            header_closed: false,
            braceless: None,
            statements: Vec::new(),
            functions: Vec::new(),
            globals: BTreeSet::new(),
        }
    }

    fn run(&mut self) {
        for l in 0..self.sanitized.len() {
            let len = self.sanitized[l].len();
            for c in 0..=len {
                let ch = if c < len { self.sanitized[l][c] } else { '\n' };
                self.step(ch, l, c);
            }
        }
    }

    fn char_at(&self, l: usize, c: usize) -> Option<char> {
        self.sanitized.get(l).and_then(|line| line.get(c)).copied()
    }

    /// The first non-whitespace character after (l, c) and its position.
    fn next_significant(&self, l: usize, c: usize) -> Option<(char, usize, usize)> {
        let (mut line, mut col) = (l, c + 1);
        while line < self.sanitized.len() {
            while col < self.sanitized[line].len() {
                let ch = self.sanitized[line][col];
                if !ch.is_whitespace() {
                    return Some((ch, line, col));
                }
                col += 1;
            }
            line += 1;
            col = 0;
        }
        None
    }

    fn word_from(&self, l: usize, c: usize) -> String {
        self.sanitized[l][c..]
            .iter()
            .take_while(|ch| is_ident_char(**ch))
            .collect()
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.start = None;
        self.header_closed = false;
    }

    fn step(&mut self, ch: char, l: usize, c: usize) {
        if self.start.is_none() {
            if ch.is_whitespace() {
                return;
            }
            self.start = Some((l, c));
        }
        match ch {
            '(' | '[' => {
                self.depth += 1;
                self.pending.push(ch);
            }
            ')' | ']' => {
                self.depth = (self.depth - 1).max(0);
                self.pending.push(ch);
                if ch == ')' && self.depth == 0 {
                    self.after_close_paren(l, c);
                }
            }
            ';' if self.depth == 0 => {
                self.pending.push(';');
                self.finish_statement(l, c);
            }
            '{' if self.depth == 0 => self.open_block(),
            '}' if self.depth == 0 => self.close_block(l),
            ':' if self.depth == 0 => {
                self.pending.push(':');
                self.maybe_label(l, c);
            }
            '\n' => self.pending.push(' '),
            _ => {
                self.pending.push(ch);
                let word_ends = !self.char_at(l, c + 1).is_some_and(is_ident_char);
                if is_ident_char(ch) && word_ends {
                    self.after_word(l, c);
                }
            }
        }
    }

    fn after_close_paren(&mut self, l: usize, c: usize) {
        if self.header_closed {
            return;
        }
        let word = first_word(&self.pending);
        if !matches!(word, "if" | "for" | "while" | "switch") {
            return;
        }
        self.header_closed = true;
        match self.next_significant(l, c) {
            Some(('{', _, _)) | Some((';', _, _)) | None => {}
            Some(_) => {
                let is_loop = matches!(word, "for" | "while");
                let declares = if word == "for" {
                    for_initializer_names(&self.pending)
                } else {
                    Vec::new()
                };
                self.braceless = Some(BracelessHeader { is_loop, declares });
                self.clear_pending();
            }
        }
    }

    fn after_word(&mut self, l: usize, c: usize) {
        let word = self.pending.trim();
        if word != "else" && word != "do" {
            return;
        }
        let is_loop = word == "do";
        match self.next_significant(l, c) {
            Some(('{', _, _)) | None => {}
            Some((_, nl, nc)) if !is_loop && self.word_from(nl, nc) == "if" => self.clear_pending(),
            Some(_) => {
                self.braceless = Some(BracelessHeader {
                    is_loop,
                    declares: Vec::new(),
                });
                self.clear_pending();
            }
        }
    }

    fn maybe_label(&mut self, l: usize, c: usize) {
        let scoped = self.char_at(l, c + 1) == Some(':') || (c > 0 && self.char_at(l, c - 1) == Some(':'));
        if scoped {
            return;
        }
        let label = self.pending.trim_end_matches(':').trim();
        let word = first_word(label);
        let single_word = !label.is_empty() && label.chars().all(is_ident_char);
        let in_function = self.current_function().is_some();
        if matches!(word, "case" | "default" | "public" | "private" | "protected")
            || (single_word && in_function)
        {
            self.clear_pending();
        }
    }

    fn current_function(&self) -> Option<usize> {
        self.stack.iter().rev().find_map(|b| match b.kind {
            BlockKind::Function(i) => Some(i),
            _ => None,
        })
    }

    fn open_block(&mut self) {
        let header = self.pending.trim().to_string();
        let header_line = self.start.map(|(l, _)| l as u32 + 1).unwrap_or(0);
        let word = first_word(&header);
        let mut declares = Vec::new();

        let kind = if self.current_function().is_some() {
            match word {
                "for" => {
                    declares = for_initializer_names(&header);
                    BlockKind::Loop
                }
                "while" | "do" => BlockKind::Loop,
                "switch" => BlockKind::Switch,
                _ => BlockKind::Block,
            }
        } else if matches!(word, "namespace" | "class" | "struct" | "union" | "enum" | "extern")
            || header.contains('=')
            || !header.contains('(')
        {
            BlockKind::Scope
        } else {
            match parse_function(&header, header_line) {
                Some(function) => {
                    self.functions.push(function);
                    BlockKind::Function(self.functions.len() - 1)
                }
                None => BlockKind::Scope,
            }
        };

        self.stack.push(OpenBlock {
            id: self.next_block_id,
            kind,
            declares,
        });
        self.next_block_id += 1;
        self.braceless = None;
        self.clear_pending();
    }

    fn close_block(&mut self, l: usize) {
        match self.stack.pop() {
            Some(OpenBlock {
                kind: BlockKind::Function(i),
                ..
            }) => self.functions[i].last_line = l as u32 + 1,
            Some(_) => {}
            None => debug!("unbalanced '}}' at line {}", l + 1),
        }
        self.braceless = None;
        self.clear_pending();
    }

    fn is_clean(&self, start: (usize, usize), end: (usize, usize)) -> bool {
        let before_blank = self.sanitized[start.0][..start.1].iter().all(|c| c.is_whitespace());
        let after_blank = self.sanitized[end.0][end.1 + 1..].iter().all(|c| c.is_whitespace());
        before_blank && after_blank
    }

    fn original_text(&self, start: (usize, usize), end: (usize, usize)) -> String {
        let mut parts = Vec::new();
        for l in start.0..=end.0 {
            let line = &self.original[l];
            let from = if l == start.0 { start.1 } else { 0 };
            let to = if l == end.0 { end.1 + 1 } else { line.len() };
            let part: String = line[from..to].iter().collect();
            let part = part.trim();
            if !part.is_empty() {
                parts.push(part.to_string());
            }
        }
        parts.join(" ")
    }

    fn finish_statement(&mut self, l: usize, c: usize) {
        let text = self.pending.trim().to_string();
        let start = self.start.unwrap_or((l, c));
        let braceless = self.braceless.take();
        self.clear_pending();

        if text == ";" {
            return;
        }
        let Some(function) = self.current_function() else {
            if let Some(names) = parse_declaration(&text) {
                self.globals.extend(names);
            }
            return;
        };
        if CONTROL_WORDS.contains(&first_word(&text)) || !self.is_clean(start, (l, c)) {
            return;
        }

        let kind = classify(&text);
        let declares = if kind == StatementKind::Declaration {
            parse_declaration(&text).unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut header_names: Vec<String> = self
            .stack
            .iter()
            .flat_map(|b| b.declares.iter().cloned())
            .collect();
        let braceless_body = braceless.is_some();
        let braceless_loop = braceless.as_ref().is_some_and(|b| b.is_loop);
        if let Some(header) = braceless {
            header_names.extend(header.declares);
        }

        let indent: String = self.original[start.0]
            .iter()
            .take_while(|c| c.is_whitespace())
            .collect();
        self.statements.push(Statement {
            location: Location::new(String::new(), start.0 as u32 + 1),
            last_line: l as u32 + 1,
            text: self.original_text(start, (l, c)),
            indent,
            kind,
            function,
            uses: used_names(&text, kind),
            declares,
            blocks: self.stack.iter().map(|b| b.id).collect(),
            header_names,
            in_loop: braceless_loop || self.stack.iter().any(|b| b.kind == BlockKind::Loop),
            in_switch: self.stack.iter().any(|b| b.kind == BlockKind::Switch),
            braceless_body,
        });
    }
}

fn classify(text: &str) -> StatementKind {
    match first_word(text) {
        "return" => StatementKind::Return,
        "break" => StatementKind::Break,
        "continue" => StatementKind::Continue,
        _ if parse_declaration(text).is_some() => StatementKind::Declaration,
        _ => StatementKind::Expression,
    }
}

/// Byte offset of the first top-level assignment `=` (not `==`, `<=`, `+=`...).
fn assignment_split(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                if next != b'=' && !b"=!<>+-*/%&|^".contains(&prev) {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_templates(text: &str) -> String {
    let mut depth = 0;
    text.chars()
        .filter(|&c| match c {
            '<' => {
                depth += 1;
                false
            }
            '>' if depth > 0 => {
                depth -= 1;
                false
            }
            _ => depth == 0,
        })
        .collect()
}

/// Identifiers of a declarator list, with `::` kept inside qualified names.
fn declarator_words(text: &str) -> Vec<String> {
    text.split(|c: char| !(is_ident_char(c) || c == ':'))
        .map(|w| w.trim_matches(':'))
        .filter(|w| !w.is_empty() && !w.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Names declared by `text` if it looks like a variable declaration.
fn parse_declaration(text: &str) -> Option<Vec<String>> {
    let body = text.trim().trim_end_matches(';').trim();
    if NON_DECLARATION_STARTERS.contains(&first_word(body)) {
        return None;
    }
    let lhs = match assignment_split(body) {
        Some(i) => &body[..i],
        None => body,
    };
    let lhs = strip_templates(lhs);
    if lhs.contains(['.', '(', ')', '+', '-', '/', '!', '|', '^', '%', '?', '"', '\'', '{']) {
        return None;
    }

    let mut names = Vec::new();
    for (i, declarator) in lhs.split(',').enumerate() {
        let declarator = declarator.split('[').next().unwrap_or("");
        let words = declarator_words(declarator);
        let required = if i == 0 { 2 } else { 1 };
        if words.len() < required {
            return None;
        }
        let name = words.last()?;
        if KEYWORDS.contains(&name.as_str()) || name.contains(':') {
            return None;
        }
        names.push(name.clone());
    }
    Some(names)
}

fn for_initializer_names(header: &str) -> Vec<String> {
    let Some(open) = header.find('(') else {
        return Vec::new();
    };
    let inner = &header[open + 1..];
    let init = match inner.find(';') {
        Some(i) => &inner[..i],
        None => {
            // range-based: `for (auto x : xs)`
            let bytes = inner.as_bytes();
            let colon = (0..bytes.len()).find(|&i| {
                bytes[i] == b':'
                    && bytes.get(i + 1) != Some(&b':')
                    && (i == 0 || bytes[i - 1] != b':')
            });
            match colon {
                Some(i) => &inner[..i],
                None => return Vec::new(),
            }
        }
    };
    parse_declaration(init).unwrap_or_default()
}

fn is_constant_name(word: &str) -> bool {
    word.chars().any(|c| c.is_ascii_uppercase())
        && !word.chars().any(|c| c.is_ascii_lowercase())
}

/// Variables referenced by a statement. Declared names and type words of a
/// declaration are not uses.
fn used_names(text: &str, kind: StatementKind) -> BTreeSet<String> {
    let scan = if kind == StatementKind::Declaration {
        match assignment_split(text) {
            Some(i) => &text[i + 1..],
            None => "",
        }
    } else {
        text
    };

    let chars: Vec<char> = scan.chars().collect();
    let mut names = BTreeSet::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if !is_ident_char(ch) {
            i += 1;
            continue;
        }
        let begin = i;
        while i < chars.len() && is_ident_char(chars[i]) {
            i += 1;
        }
        if ch.is_ascii_digit() {
            continue;
        }
        let word: String = chars[begin..i].iter().collect();

        let before: String = chars[..begin]
            .iter()
            .rev()
            .skip_while(|c| c.is_whitespace())
            .take(2)
            .collect();
        let qualified_member = before.starts_with('.') || before == ">-" || before == "::";
        let after: String = chars[i..]
            .iter()
            .skip_while(|c| c.is_whitespace())
            .take(2)
            .collect();
        let called_or_scope = after.starts_with('(') || after == "::";

        if qualified_member
            || called_or_scope
            || KEYWORDS.contains(&word.as_str())
            || is_constant_name(&word)
        {
            continue;
        }
        names.insert(word);
    }
    names
}

/// Parses a function definition header such as `bool AP_Beacon::healthy(void) const`.
fn parse_function(header: &str, first_line: u32) -> Option<Function> {
    if CONTROL_WORDS.contains(&first_word(header)) {
        return None;
    }
    let open = header.find('(')?;
    let before = header[..open].trim_end();
    let name_start = before
        .rfind(|c: char| !(is_ident_char(c) || c == ':' || c == '~'))
        .map_or(0, |i| i + 1);
    let name = before[name_start..].to_string();
    if name.is_empty() {
        return None;
    }

    let return_type = before[..name_start]
        .split_whitespace()
        .filter(|w| !SPECIFIERS.contains(w))
        .collect::<Vec<_>>()
        .join(" ");
    let return_type = (!return_type.is_empty()).then_some(return_type);

    let mut depth = 0;
    let mut close = header.len();
    for (i, ch) in header[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = open + i;
                    break;
                }
            }
            _ => {}
        }
    }
    let params = header[open + 1..close]
        .split(',')
        .filter_map(|param| {
            let param = param.split('=').next().unwrap_or("");
            let param = strip_templates(param.split('[').next().unwrap_or(""));
            let words = declarator_words(&param);
            (words.len() >= 2).then(|| words.last().cloned()).flatten()
        })
        .collect();

    Some(Function {
        name,
        return_type,
        first_line,
        last_line: first_line,
        params,
    })
}
