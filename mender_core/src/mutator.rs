use crate::coverage::CoverageRecord;
use crate::localization::Localization;
use crate::scenario::{Optimizations, SchemaKind};
use crate::source::{Location, SourceFile, SourceIndex, Statement, StatementKind, normalize_whitespace};
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

/// A statement of the program that can be inserted elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Snippet {
    pub text: String,
    pub kind: StatementKind,
    pub uses: BTreeSet<String>,
    /// Where the snippet was first found.
    pub origin: Location,
    /// Return type of the function it was found in, `None` for void.
    pub return_type: Option<String>,
}

/// Insertable statements, deduplicated by whitespace-normalized text and
/// ordered by origin.
#[derive(Debug, Clone, Default)]
pub struct SnippetDatabase {
    snippets: Vec<Snippet>,
}

impl SnippetDatabase {
    /// Collects every indexed statement, or only those some test executed when
    /// `executed_by` is given.
    pub fn build(index: &SourceIndex, executed_by: Option<&CoverageRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut snippets = Vec::new();
        for file in index.files() {
            for statement in file.statements() {
                if executed_by.is_some_and(|c| !c.executed_by_any(&statement.location)) {
                    continue;
                }
                if !seen.insert(normalize_whitespace(&statement.text)) {
                    continue;
                }
                snippets.push(Snippet {
                    text: statement.text.clone(),
                    kind: statement.kind,
                    uses: statement.uses.clone(),
                    origin: statement.location.clone(),
                    return_type: file.function_of(statement).value_type(),
                });
            }
        }
        debug!("snippet database holds {} statements", snippets.len());
        Self { snippets }
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snippet> {
        self.snippets.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Snippet> {
        self.snippets.get(index)
    }
}

/// Rewrites `target` in `file` according to `schema` and returns the new file content.
///
/// Deleting the unbraced body of a control header leaves an empty statement so
/// the header keeps a body.
pub fn apply_schema(
    file: &SourceFile,
    target: &Statement,
    schema: SchemaKind,
    payload: Option<&str>,
) -> String {
    let lines = file.lines();
    let first = target.location.line.saturating_sub(1) as usize;
    let end = (target.last_line as usize).min(lines.len());

    let mut patched: Vec<String> = Vec::with_capacity(lines.len() + 1);
    patched.extend_from_slice(&lines[..first]);
    match schema {
        SchemaKind::DeleteStatement => {
            if target.braceless_body {
                patched.push(format!("{};", target.indent));
            }
        }
        SchemaKind::ReplaceStatement => {
            patched.push(format!("{}{}", target.indent, payload.unwrap_or(";")));
        }
        SchemaKind::PrependStatement => {
            if let Some(payload) = payload {
                patched.push(format!("{}{}", target.indent, payload));
            }
            patched.extend_from_slice(&lines[first..end]);
        }
    }
    patched.extend_from_slice(&lines[end..]);
    file.render(&patched)
}

/// One proposed source edit.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Position in the generator's order, starting at 0.
    pub rank: u64,
    pub location: Location,
    pub schema: SchemaKind,
    pub payload: Option<String>,
    /// Full content of the mutated file.
    pub patched: String,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} @ {}", self.rank, self.schema.as_str(), self.location)?;
        if let Some(payload) = &self.payload {
            write!(f, " with `{payload}`")?;
        }
        Ok(())
    }
}

/// A candidate under consideration by the filters.
pub struct Proposal<'a> {
    pub schema: SchemaKind,
    pub file: &'a SourceFile,
    pub target: &'a Statement,
    pub snippet: Option<&'a Snippet>,
    pub coverage: &'a CoverageRecord,
    /// Names visible at the target; computed once per location.
    pub visible: &'a BTreeSet<String>,
    patched: OnceCell<String>,
}

impl<'a> Proposal<'a> {
    pub fn new(
        schema: SchemaKind,
        file: &'a SourceFile,
        target: &'a Statement,
        snippet: Option<&'a Snippet>,
        coverage: &'a CoverageRecord,
        visible: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            schema,
            file,
            target,
            snippet,
            coverage,
            visible,
            patched: OnceCell::new(),
        }
    }

    /// The mutated file, computed on first use.
    pub fn patched(&self) -> &str {
        self.patched.get_or_init(|| {
            apply_schema(
                self.file,
                self.target,
                self.schema,
                self.snippet.map(|s| s.text.as_str()),
            )
        })
    }

    fn inserts(&self) -> Option<&'a Snippet> {
        match self.schema {
            SchemaKind::DeleteStatement => None,
            _ => self.snippet,
        }
    }

    fn into_candidate(self, rank: u64) -> Candidate {
        self.patched();
        Candidate {
            rank,
            location: self.target.location.clone(),
            schema: self.schema,
            payload: self.snippet.map(|s| s.text.clone()),
            patched: self.patched.into_inner().unwrap_or_default(),
        }
    }
}

/// Prunes candidates before evaluation. A filter may only remove candidates.
pub trait CandidateFilter: Send {
    fn name(&self) -> &'static str;
    fn admits(&mut self, proposal: &Proposal<'_>) -> bool;
}

/// Skips edits at lines no test executed.
#[derive(Debug, Default)]
pub struct DeadCodeFilter;

impl CandidateFilter for DeadCodeFilter {
    fn name(&self) -> &'static str {
        "ignore-dead-code"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        proposal.coverage.executed_by_any(&proposal.target.location)
    }
}

/// Skips deleting or replacing declarations.
#[derive(Debug, Default)]
pub struct DeclarationFilter;

impl CandidateFilter for DeclarationFilter {
    fn name(&self) -> &'static str {
        "ignore-decls"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        proposal.schema == SchemaKind::PrependStatement
            || proposal.target.kind != StatementKind::Declaration
    }
}

/// Skips replacements that leave the text unchanged up to whitespace.
#[derive(Debug, Default)]
pub struct StringEquivalenceFilter;

impl CandidateFilter for StringEquivalenceFilter {
    fn name(&self) -> &'static str {
        "ignore-string-equivalent-snippets"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        match (proposal.schema, proposal.snippet) {
            (SchemaKind::ReplaceStatement, Some(snippet)) => {
                normalize_whitespace(&snippet.text) != normalize_whitespace(&proposal.target.text)
            }
            _ => true,
        }
    }
}

/// Skips inserted returns that disagree with the enclosing function's return type.
#[derive(Debug, Default)]
pub struct UntypedReturnFilter;

impl CandidateFilter for UntypedReturnFilter {
    fn name(&self) -> &'static str {
        "ignore-untyped-returns"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        let Some(snippet) = proposal.inserts() else {
            return true;
        };
        if snippet.kind != StatementKind::Return {
            return true;
        }
        snippet.return_type == proposal.file.function_of(proposal.target).value_type()
    }
}

/// Skips insertions that are not well-formed where they land: `break` outside
/// a loop or switch, `continue` outside a loop, and anything that would split
/// an unbraced control body.
#[derive(Debug, Default)]
pub struct SyntaxScopeFilter;

impl CandidateFilter for SyntaxScopeFilter {
    fn name(&self) -> &'static str {
        "use-syntax-scope-checking"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        let Some(snippet) = proposal.inserts() else {
            return true;
        };
        let target = proposal.target;
        if target.braceless_body
            && (proposal.schema == SchemaKind::PrependStatement
                || snippet.kind == StatementKind::Declaration)
        {
            return false;
        }
        match snippet.kind {
            StatementKind::Break => target.in_loop || target.in_switch,
            StatementKind::Continue => target.in_loop,
            _ => true,
        }
    }
}

/// Skips insertions referring to variables not visible at the target.
#[derive(Debug, Default)]
pub struct ScopeFilter;

impl CandidateFilter for ScopeFilter {
    fn name(&self) -> &'static str {
        "use-scope-checking"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        proposal
            .inserts()
            .is_none_or(|snippet| snippet.uses.is_subset(proposal.visible))
    }
}

/// Generates each distinct prepend result once, keyed on an md5 digest of the
/// mutated file.
#[derive(Debug, Default)]
pub struct EquivalentPrependFilter {
    known_hashes: HashSet<[u8; 16]>,
}

impl CandidateFilter for EquivalentPrependFilter {
    fn name(&self) -> &'static str {
        "ignore-equivalent-prepends"
    }

    fn admits(&mut self, proposal: &Proposal<'_>) -> bool {
        if proposal.schema != SchemaKind::PrependStatement {
            return true;
        }
        let mut context = md5::Context::new();
        context.consume(proposal.file.path().as_bytes());
        context.consume([0u8]);
        context.consume(proposal.patched().as_bytes());
        self.known_hashes.insert(context.compute().0)
    }
}

/// The enabled filters, in the order they are applied.
pub fn filters_for(optimizations: &Optimizations) -> Vec<Box<dyn CandidateFilter>> {
    let mut filters: Vec<Box<dyn CandidateFilter>> = Vec::new();
    if optimizations.ignore_dead_code {
        filters.push(Box::new(DeadCodeFilter));
    }
    if optimizations.ignore_decls {
        filters.push(Box::new(DeclarationFilter));
    }
    if optimizations.ignore_string_equivalent_snippets {
        filters.push(Box::new(StringEquivalenceFilter));
    }
    if optimizations.ignore_untyped_returns {
        filters.push(Box::new(UntypedReturnFilter));
    }
    if optimizations.use_syntax_scope_checking {
        filters.push(Box::new(SyntaxScopeFilter));
    }
    if optimizations.use_scope_checking {
        filters.push(Box::new(ScopeFilter));
    }
    if optimizations.ignore_equivalent_prepends {
        filters.push(Box::new(EquivalentPrependFilter::default()));
    }
    filters
}

/// Produces candidates in order of descending location suspiciousness, then
/// schema order, then snippet order.
pub struct MutationGenerator<'a> {
    localization: &'a Localization,
    index: &'a SourceIndex,
    coverage: &'a CoverageRecord,
    snippets: SnippetDatabase,
    schemas: Vec<SchemaKind>,
    optimizations: Optimizations,
}

impl<'a> MutationGenerator<'a> {
    pub fn new(
        localization: &'a Localization,
        index: &'a SourceIndex,
        coverage: &'a CoverageRecord,
        schemas: Vec<SchemaKind>,
        optimizations: Optimizations,
    ) -> Self {
        let executed_by = optimizations.only_insert_executed_code.then_some(coverage);
        let snippets = SnippetDatabase::build(index, executed_by);
        Self {
            localization,
            index,
            coverage,
            snippets,
            schemas,
            optimizations,
        }
    }

    pub fn snippets(&self) -> &SnippetDatabase {
        &self.snippets
    }

    /// A fresh lazy stream over the candidate space.
    pub fn candidates(&self) -> CandidateStream<'_> {
        CandidateStream {
            generator: self,
            filters: filters_for(&self.optimizations),
            location: 0,
            schema: 0,
            payload: 0,
            visible: None,
            next_rank: 0,
            considered: 0,
            rejected: BTreeMap::new(),
        }
    }
}

/// Cursor over (location, schema, payload). Nothing is generated ahead of demand.
pub struct CandidateStream<'g> {
    generator: &'g MutationGenerator<'g>,
    filters: Vec<Box<dyn CandidateFilter>>,
    location: usize,
    schema: usize,
    payload: usize,
    /// Names visible at the current location.
    visible: Option<BTreeSet<String>>,
    next_rank: u64,
    considered: u64,
    rejected: BTreeMap<&'static str, u64>,
}

impl CandidateStream<'_> {
    /// Proposals examined so far, including rejected ones.
    pub fn considered(&self) -> u64 {
        self.considered
    }

    /// Rejection counts per filter.
    pub fn rejections(&self) -> &BTreeMap<&'static str, u64> {
        &self.rejected
    }

    fn advance_location(&mut self) {
        self.location += 1;
        self.schema = 0;
        self.payload = 0;
        self.visible = None;
    }

    fn advance_schema(&mut self) {
        self.schema += 1;
        self.payload = 0;
    }
}

impl Iterator for CandidateStream<'_> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        let generator = self.generator;
        loop {
            let ranked = generator.localization.get(self.location)?;
            let Some((file, target)) = generator.index.statement_at(&ranked.location) else {
                self.advance_location();
                continue;
            };
            let Some(&schema) = generator.schemas.get(self.schema) else {
                self.advance_location();
                continue;
            };

            let snippet = match schema {
                SchemaKind::DeleteStatement => {
                    if self.payload > 0 {
                        self.advance_schema();
                        continue;
                    }
                    None
                }
                _ => match generator.snippets.get(self.payload) {
                    Some(snippet) => Some(snippet),
                    None => {
                        self.advance_schema();
                        continue;
                    }
                },
            };
            self.payload += 1;
            self.considered += 1;

            let visible = self.visible.get_or_insert_with(|| file.visible_names(target));
            let proposal = Proposal::new(schema, file, target, snippet, generator.coverage, visible);
            let mut rejected_by = None;
            for filter in self.filters.iter_mut() {
                if !filter.admits(&proposal) {
                    rejected_by = Some(filter.name());
                    break;
                }
            }
            if let Some(name) = rejected_by {
                *self.rejected.entry(name).or_insert(0) += 1;
                continue;
            }

            let candidate = proposal.into_candidate(self.next_rank);
            self.next_rank += 1;
            return Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{LineCounts, TestCoverage};
    use crate::scenario::SpectrumMetric;
    use crate::source::tests::BEACON;
    use crate::source::{CFamilyAnalyzer, SourceAnalyzer};

    const FILE: &str = "libraries/AP_Beacon/AP_Beacon.cpp";

    fn index() -> SourceIndex {
        let mut index = SourceIndex::default();
        index.insert(CFamilyAnalyzer.analyze(FILE, BEACON));
        index
    }

    /// `attacked` fails and alone runs the `trust_origin` assignment (line 17).
    /// Nothing runs the `msg` declaration (line 31).
    fn coverage() -> CoverageRecord {
        let executed_by_all = [9, 14, 15, 21, 22, 26, 27, 29, 32];
        let lines = |extra: &[u32], missing: &[u32]| {
            let counts: LineCounts = executed_by_all
                .iter()
                .map(|&l| (l, 1))
                .chain(extra.iter().map(|&l| (l, 1)))
                .chain(missing.iter().map(|&l| (l, 0)))
                .chain(std::iter::once((31, 0)))
                .collect();
            BTreeMap::from([(FILE.to_string(), counts)])
        };
        CoverageRecord {
            tests: vec![
                TestCoverage {
                    test: "attacked".to_string(),
                    observed_success: true,
                    expected_success: false,
                    lines: lines(&[17], &[]),
                },
                TestCoverage {
                    test: "nominal".to_string(),
                    observed_success: true,
                    expected_success: true,
                    lines: lines(&[], &[17]),
                },
            ],
        }
    }

    const ALL_SCHEMAS: [SchemaKind; 3] = [
        SchemaKind::DeleteStatement,
        SchemaKind::ReplaceStatement,
        SchemaKind::PrependStatement,
    ];

    fn all_on() -> Optimizations {
        Optimizations {
            ignore_equivalent_prepends: true,
            ignore_dead_code: true,
            ignore_string_equivalent_snippets: true,
            ignore_untyped_returns: true,
            ignore_decls: true,
            use_scope_checking: true,
            use_syntax_scope_checking: true,
            only_insert_executed_code: true,
        }
    }

    fn keys(candidates: &[Candidate]) -> BTreeSet<(Location, SchemaKind, Option<String>)> {
        candidates
            .iter()
            .map(|c| (c.location.clone(), c.schema, c.payload.clone()))
            .collect()
    }

    #[test]
    fn apply_schema_edits_lines() {
        let index = index();
        let file = index.get(FILE).unwrap();
        let target = file.statement_at(17).unwrap();

        let deleted = apply_schema(file, target, SchemaKind::DeleteStatement, None);
        assert!(!deleted.contains("trust_origin = true;"));
        assert_eq!(deleted.lines().count(), BEACON.lines().count() - 1);

        let replaced = apply_schema(file, target, SchemaKind::ReplaceStatement, Some("count = 0;"));
        assert!(replaced.contains("\n        count = 0;\n    }\n"));

        let prepended = apply_schema(file, target, SchemaKind::PrependStatement, Some("update_count++;"));
        assert!(prepended.contains("        update_count++;\n        trust_origin = true;\n"));
        assert!(prepended.ends_with("}\n"));
    }

    #[test]
    fn deleting_an_unbraced_body_leaves_an_empty_statement() {
        let index = index();
        let file = index.get(FILE).unwrap();
        let deleted = apply_schema(file, file.statement_at(21).unwrap(), SchemaKind::DeleteStatement, None);
        assert!(deleted.contains("        if (i == 2)\n            ;\n"));
    }

    #[test]
    fn multi_line_statements_are_replaced_whole() {
        let index = index();
        let file = index.get(FILE).unwrap();
        let replaced = apply_schema(file, file.statement_at(32).unwrap(), SchemaKind::ReplaceStatement, Some("count++;"));
        assert!(!replaced.contains("log_status"));
        assert!(!replaced.contains("count);"));
    }

    #[test]
    fn snippet_database_dedups_and_optionally_keeps_executed_only() {
        let index = index();
        let everything = SnippetDatabase::build(&index, None);
        let texts: Vec<&str> = everything.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts.iter().filter(|t| **t == "break;").count(), 1);

        let coverage = coverage();
        let executed = SnippetDatabase::build(&index, Some(&coverage));
        assert!(executed.len() < everything.len());
        assert!(executed.iter().all(|s| coverage.executed_by_any(&s.origin)));
        // line 29 duplicates line 27 and is not its own snippet
        assert!(executed.iter().all(|s| s.origin.line != 29));
    }

    #[test]
    fn stream_starts_at_the_most_suspicious_line_in_schema_order() {
        let index = index();
        let coverage = coverage();
        let localization = Localization::from_coverage(&coverage, SpectrumMetric::Weighted, &[]);
        let generator = MutationGenerator::new(
            &localization,
            &index,
            &coverage,
            ALL_SCHEMAS.to_vec(),
            Optimizations::default(),
        );

        let first: Vec<Candidate> = generator.candidates().take(3).collect();
        assert_eq!(first[0].location, Location::new(FILE, 17));
        assert_eq!(first[0].schema, SchemaKind::DeleteStatement);
        assert_eq!(first[0].rank, 0);
        assert_eq!(first[1].schema, SchemaKind::ReplaceStatement);
        assert_eq!(first[1].payload.as_deref(), Some(generator.snippets().get(0).unwrap().text.as_str()));
        assert_eq!(first[2].rank, 2);
    }

    #[test]
    fn stream_is_lazy_and_restartable() {
        let index = index();
        let coverage = coverage();
        let localization = Localization::from_coverage(&coverage, SpectrumMetric::Weighted, &[]);
        let generator = MutationGenerator::new(&localization, &index, &coverage, ALL_SCHEMAS.to_vec(), Optimizations::default());

        let mut stream = generator.candidates();
        let _ = stream.next();
        assert_eq!(stream.considered(), 1);

        let all: Vec<Candidate> = generator.candidates().collect();
        let again: Vec<Candidate> = generator.candidates().collect();
        assert_eq!(all, again);
        let per_location = 1 + 2 * generator.snippets().len();
        assert_eq!(all.len(), localization.len() * per_location);
    }

    #[test]
    fn enabling_filters_only_removes_candidates() {
        let index = index();
        let coverage = coverage();
        let localization = Localization::from_coverage(&coverage, SpectrumMetric::Weighted, &[]);
        let unfiltered = MutationGenerator::new(&localization, &index, &coverage, ALL_SCHEMAS.to_vec(), Optimizations::default());
        let baseline = keys(&unfiltered.candidates().collect::<Vec<_>>());

        let flags: [fn(&mut Optimizations); 7] = [
            |o| o.ignore_equivalent_prepends = true,
            |o| o.ignore_dead_code = true,
            |o| o.ignore_string_equivalent_snippets = true,
            |o| o.ignore_untyped_returns = true,
            |o| o.ignore_decls = true,
            |o| o.use_scope_checking = true,
            |o| o.use_syntax_scope_checking = true,
        ];
        for enable in flags {
            let mut optimizations = Optimizations::default();
            enable(&mut optimizations);
            let generator = MutationGenerator::new(&localization, &index, &coverage, ALL_SCHEMAS.to_vec(), optimizations.clone());
            let filtered = keys(&generator.candidates().collect::<Vec<_>>());
            assert!(filtered.is_subset(&baseline), "{optimizations:?} added candidates");
            assert!(filtered.len() < baseline.len(), "{optimizations:?} removed nothing");
        }

        let all = MutationGenerator::new(&localization, &index, &coverage, ALL_SCHEMAS.to_vec(), all_on());
        let candidates: Vec<Candidate> = all.candidates().collect();
        assert_eq!(
            candidates[0].location,
            Location::new(FILE, 17),
            "the faulty line's deletion survives every filter"
        );
        assert_eq!(candidates[0].schema, SchemaKind::DeleteStatement);
    }

    fn proposal_verdict(filter: &mut dyn CandidateFilter, schema: SchemaKind, target_line: u32, snippet_text: &str) -> bool {
        let index = index();
        let coverage = coverage();
        let file = index.get(FILE).unwrap();
        let target = file.statement_at(target_line).unwrap();
        let source = file
            .statements()
            .iter()
            .find(|s| s.text == snippet_text)
            .unwrap_or_else(|| panic!("no statement '{snippet_text}'"));
        let snippet = Snippet {
            text: source.text.clone(),
            kind: source.kind,
            uses: source.uses.clone(),
            origin: source.location.clone(),
            return_type: file.function_of(source).value_type(),
        };
        let visible = file.visible_names(target);
        let proposal = Proposal::new(schema, file, target, Some(&snippet), &coverage, &visible);
        filter.admits(&proposal)
    }

    #[test]
    fn syntax_scope_filter_places_break_and_continue() {
        let mut filter = SyntaxScopeFilter;
        let replace = SchemaKind::ReplaceStatement;
        assert!(!proposal_verdict(&mut filter, replace, 17, "break;"));
        assert!(proposal_verdict(&mut filter, replace, 22, "break;"));
        assert!(proposal_verdict(&mut filter, replace, 26, "break;"));
        assert!(!proposal_verdict(&mut filter, replace, 26, "continue;"));
        assert!(!proposal_verdict(&mut filter, SchemaKind::PrependStatement, 21, "count += i;"));
    }

    #[test]
    fn scope_filter_rejects_out_of_scope_variables() {
        let mut filter = ScopeFilter;
        let replace = SchemaKind::ReplaceStatement;
        assert!(proposal_verdict(&mut filter, replace, 22, "count += i;"));
        assert!(!proposal_verdict(&mut filter, replace, 17, "count += i;"));
        assert!(!proposal_verdict(&mut filter, replace, 9, "log_status(msg, count);"));
    }

    #[test]
    fn untyped_return_filter_matches_function_type() {
        let mut filter = UntypedReturnFilter;
        // `return ok;` returns a value; `update` is void
        assert!(!proposal_verdict(&mut filter, SchemaKind::PrependStatement, 17, "return ok;"));
        assert!(proposal_verdict(&mut filter, SchemaKind::PrependStatement, 9, "return ok;"));
    }

    #[test]
    fn untyped_return_filter_compares_value_types() {
        let file = CFamilyAnalyzer.analyze(
            "ratio.c",
            "bool ok() {\n    return flag;\n}\nfloat ratio() {\n    x = 1;\n    return 0.5f;\n}\nbool again() {\n    y = 2;\n    return true;\n}\n",
        );
        let coverage = coverage();
        let snippet_from = |line: u32| {
            let statement = file.statement_at(line).unwrap();
            Snippet {
                text: statement.text.clone(),
                kind: statement.kind,
                uses: statement.uses.clone(),
                origin: statement.location.clone(),
                return_type: file.function_of(statement).value_type(),
            }
        };
        let return_flag = snippet_from(2);
        assert_eq!(return_flag.return_type.as_deref(), Some("bool"));
        let verdict = |target_line: u32| {
            let target = file.statement_at(target_line).unwrap();
            let visible = file.visible_names(target);
            let proposal = Proposal::new(
                SchemaKind::PrependStatement,
                &file,
                target,
                Some(&return_flag),
                &coverage,
                &visible,
            );
            UntypedReturnFilter.admits(&proposal)
        };
        assert!(!verdict(5), "a bool return does not belong in a float function");
        assert!(verdict(9));
    }

    #[test]
    fn declaration_and_string_equivalence_filters() {
        assert!(!proposal_verdict(&mut DeclarationFilter, SchemaKind::ReplaceStatement, 14, "count = 2;"));
        assert!(proposal_verdict(&mut DeclarationFilter, SchemaKind::PrependStatement, 14, "count = 2;"));
        assert!(!proposal_verdict(&mut StringEquivalenceFilter, SchemaKind::ReplaceStatement, 26, "count = 2;"));
        assert!(proposal_verdict(&mut StringEquivalenceFilter, SchemaKind::ReplaceStatement, 17, "count = 2;"));
    }

    #[test]
    fn equivalent_prepends_are_generated_once() {
        let mut index = SourceIndex::default();
        index.insert(CFamilyAnalyzer.analyze("a.c", "void f() {\n    x++;\n    x++;\n}\n"));
        let coverage = CoverageRecord {
            tests: vec![TestCoverage {
                test: "t".to_string(),
                observed_success: false,
                expected_success: true,
                lines: BTreeMap::from([("a.c".to_string(), LineCounts::from([(2, 1), (3, 1)]))]),
            }],
        };
        let localization = Localization::from_coverage(&coverage, SpectrumMetric::Ochiai, &[]);
        let optimizations = Optimizations {
            ignore_equivalent_prepends: true,
            ..Optimizations::default()
        };
        let generator = MutationGenerator::new(
            &localization,
            &index,
            &coverage,
            vec![SchemaKind::PrependStatement],
            optimizations,
        );
        let mut stream = generator.candidates();
        let candidates: Vec<Candidate> = stream.by_ref().collect();
        assert_eq!(candidates.len(), 1, "prepending x++ before either line gives the same file");
        assert_eq!(stream.rejections().get("ignore-equivalent-prepends"), Some(&1));
    }
}
