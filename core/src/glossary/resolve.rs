use std::io::{BufRead, Write};

use super::{Conflict, Glossary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Validate this translation.
    Choose(String),
    /// Validate the most observed translation.
    Majority,
    /// Decide later; deferred terms fall back to the majority at the end.
    Defer,
    /// Stop resolving; the glossary is not considered validated.
    Abort,
}

pub trait ConflictResolver {
    /// `position` is 1-based among `total` conflicts.
    fn resolve(&mut self, conflict: &Conflict, position: usize, total: usize) -> Resolution;
}

/// Always takes the majority.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoResolver;

impl ConflictResolver for AutoResolver {
    fn resolve(&mut self, _conflict: &Conflict, _position: usize, _total: usize) -> Resolution {
        Resolution::Majority
    }
}

/// Asks a person through any line-based input and output.
///
/// Accepted answers: a translation number, `a` (majority), `s` (defer),
/// `q` (abort). End of input aborts.
pub struct PromptResolver<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptResolver<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.input, self.output)
    }

    fn show(&mut self, conflict: &Conflict, position: usize, total: usize) {
        let sum = conflict.total().max(1);
        let _ = writeln!(self.output, "\n[{position}/{total}] Term: '{}'", conflict.term);
        for (number, (translation, count)) in conflict.translations.iter().enumerate() {
            let _ = writeln!(
                self.output,
                "  {}. '{translation}' ({count}x, {:.0}%)",
                number + 1,
                *count as f64 * 100.0 / sum as f64
            );
        }
    }
}

impl<R: BufRead, W: Write> ConflictResolver for PromptResolver<R, W> {
    fn resolve(&mut self, conflict: &Conflict, position: usize, total: usize) -> Resolution {
        self.show(conflict, position, total);
        loop {
            let _ = write!(self.output, "Choice [number/a/s/q]: ");
            let _ = self.output.flush();

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return Resolution::Abort,
                Ok(_) => {}
            }

            match line.trim().to_lowercase().as_str() {
                "q" => return Resolution::Abort,
                "s" => return Resolution::Defer,
                "a" => return Resolution::Majority,
                choice => match choice.parse::<usize>() {
                    Ok(number) if (1..=conflict.translations.len()).contains(&number) => {
                        return Resolution::Choose(conflict.translations[number - 1].0.clone());
                    }
                    Ok(_) => {
                        let _ = writeln!(
                            self.output,
                            "Invalid number (1-{})",
                            conflict.translations.len()
                        );
                    }
                    Err(_) => {
                        let _ = writeln!(self.output, "Type a number, 'a', 's' or 'q'");
                    }
                },
            }
        }
    }
}

/// Resolves every current conflict through `resolver`.
///
/// Returns `false` when the resolver aborts; choices made before the abort
/// are kept.
pub fn resolve_conflicts(glossary: &mut Glossary, resolver: &mut dyn ConflictResolver) -> bool {
    let conflicts = glossary.conflicts();
    if conflicts.is_empty() {
        log::info!("glossary has no conflicting terms");
        return true;
    }
    log::warn!("{} glossary term(s) have conflicting translations", conflicts.len());

    let total = conflicts.len();
    let mut deferred = Vec::new();
    for (position, conflict) in conflicts.iter().enumerate() {
        match resolver.resolve(conflict, position + 1, total) {
            Resolution::Choose(translation) => {
                log::info!("glossary: {} → {translation}", conflict.term);
                glossary.validate(&conflict.term, &translation);
            }
            Resolution::Majority => validate_majority(glossary, &conflict.term),
            Resolution::Defer => deferred.push(conflict.term.clone()),
            Resolution::Abort => {
                log::warn!("glossary validation aborted");
                return false;
            }
        }
    }

    for term in deferred {
        validate_majority(glossary, &term);
    }
    true
}

fn validate_majority(glossary: &mut Glossary, term: &str) {
    if let Some(majority) = glossary.majority(term).map(str::to_string) {
        log::debug!("glossary: {term} → {majority} (majority)");
        glossary.validate(term, &majority);
    }
}
