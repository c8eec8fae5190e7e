//! Denylist screening of generated programs before execution.
//!
//! Matching is deliberately coarse: a hit does not prove the code is
//! harmful, it only forces an explicit confirmation before anything is
//! spawned. Code with no hits runs without prompting.

use regex::Regex;

const RULES: &[(&str, &str)] = &[
    (
        "shell or process execution",
        r"\bsubprocess\b|\bos\.system\s*\(|\bos\.popen\s*\(|\bPopen\s*\(|shell\s*=\s*True",
    ),
    (
        "dynamic code evaluation",
        r"\beval\s*\(|\bexec\s*\(|\b__import__\s*\(|\bcompile\s*\(",
    ),
    (
        "destructive file operation",
        r"\bshutil\.rmtree\s*\(|\bos\.remove\s*\(|\bos\.unlink\s*\(|\bos\.rmdir\s*\(|\bos\.removedirs\s*\(|\brm\s+-rf?\b",
    ),
    (
        "unsafe deserialization",
        r"\bpickle\.loads?\s*\(|\bmarshal\.loads?\s*\(|\byaml\.load\s*\(",
    ),
];

/// Pattern-matches generated code against the fixed denylist.
#[derive(Debug, Clone)]
pub struct SafetyScreener {
    rules: Vec<(&'static str, Regex)>,
}

impl Default for SafetyScreener {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyScreener {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .map(|(label, pattern)| {
                (
                    *label,
                    Regex::new(pattern).expect("denylist pattern is valid"),
                )
            })
            .collect();
        Self { rules }
    }

    /// Labels of every denylist family the code matches; empty means the
    /// code may run without confirmation.
    pub fn screen(&self, code: &str) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|(_, pattern)| pattern.is_match(code))
            .map(|(label, _)| *label)
            .collect()
    }
}

/// Decides whether a flagged program may run anyway. The front-end owns
/// the actual prompt; "yes" downgrades the screening result, anything
/// else blocks the run.
pub trait ConfirmRun: Send + Sync {
    fn confirm_run(&self, code: &str, matched: &[&'static str]) -> bool;
}

/// Gate that never allows flagged code; useful for headless runs.
pub struct DenyAll;

impl ConfirmRun for DenyAll {
    fn confirm_run(&self, _code: &str, _matched: &[&'static str]) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_code_passes_silently() {
        let screener = SafetyScreener::new();
        let code = "import json\nwith open('data.json') as f:\n    print(json.load(f))";
        assert!(screener.screen(code).is_empty());
    }

    #[test]
    fn test_shell_execution_is_flagged() {
        let screener = SafetyScreener::new();
        let hits = screener.screen("import subprocess\nsubprocess.run(['ls'])");
        assert_eq!(hits, vec!["shell or process execution"]);
        assert!(!screener
            .screen("os.system('echo hi')")
            .is_empty());
    }

    #[test]
    fn test_dynamic_evaluation_is_flagged() {
        let screener = SafetyScreener::new();
        assert!(!screener.screen("eval(user_input)").is_empty());
        assert!(!screener.screen("exec(payload)").is_empty());
    }

    #[test]
    fn test_destructive_delete_is_flagged() {
        let screener = SafetyScreener::new();
        let hits = screener.screen("import shutil\nshutil.rmtree('/tmp/project')");
        assert_eq!(hits, vec!["destructive file operation"]);
        assert!(!screener
            .screen("os.system('rm -rf /tmp/project')")
            .is_empty());
    }

    #[test]
    fn test_unsafe_deserialization_is_flagged() {
        let screener = SafetyScreener::new();
        assert!(!screener.screen("pickle.loads(blob)").is_empty());
        assert!(!screener.screen("yaml.load(stream)").is_empty());
    }

    #[test]
    fn test_multiple_families_all_reported() {
        let screener = SafetyScreener::new();
        let hits = screener.screen("eval(x)\nshutil.rmtree(y)");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_eval_inside_identifier_is_not_flagged() {
        let screener = SafetyScreener::new();
        assert!(screener.screen("retrieval_results = fetch()").is_empty());
    }
}
