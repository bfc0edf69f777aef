//! Selection engine
//!
//! A [`Selector`] is compiled once per promise from [`SelectionCriteria`]
//! and evaluated against each candidate's metadata. Every criterion sets a
//! named flag; an empty criterion leaves its flag set, so absence of a
//! constraint is always satisfied. The configured result rule then combines
//! the flags.

mod expr;

pub use expr::Expr;

use crate::exec::{CommandRunner, expand_promiser};
use crate::mode::ModeMask;
use crate::principal::{resolve_gid, resolve_uid};
use crate::spec::{SelectionCriteria, SizeWindow, TimeWindow};
use crate::{Error, Result};
use converge_fs::FileMetadata;
use converge_fs::path::leaf_name;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Services the selector may need while evaluating one file.
pub struct Probe<'a> {
    pub read_link: &'a dyn Fn(&Path) -> Option<PathBuf>,
    pub runner: &'a dyn CommandRunner,
}

#[derive(Debug, Clone)]
enum ResultRule {
    All,
    Any,
    None,
    Expr(Expr),
}

/// Compiled selection criteria.
#[derive(Debug, Clone)]
pub struct Selector {
    names: Vec<Regex>,
    paths: Vec<Regex>,
    types: Vec<String>,
    owners: Vec<Option<u32>>,
    groups: Vec<Option<u32>>,
    perms: Vec<ModeMask>,
    mtime: Option<TimeWindow>,
    atime: Option<TimeWindow>,
    ctime: Option<TimeWindow>,
    size: Option<SizeWindow>,
    issymlinkto: Vec<Regex>,
    exec_regex: Option<Regex>,
    exec_program: Option<String>,
    rule: ResultRule,
}

/// Compile `pattern` so it must match the whole subject.
pub fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| Error::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn anchored_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| anchored(p)).collect()
}

impl Selector {
    pub fn compile(criteria: &SelectionCriteria) -> Result<Self> {
        let rule = match criteria.result.as_deref().map(str::trim) {
            None | Some("all") => ResultRule::All,
            Some("any") => ResultRule::Any,
            Some("none") => ResultRule::None,
            Some(text) => ResultRule::Expr(Expr::parse(text)?),
        };

        Ok(Self {
            names: anchored_all(&criteria.names)?,
            paths: anchored_all(&criteria.paths)?,
            types: criteria.types.clone(),
            owners: criteria.owners.iter().map(|o| resolve_uid(o)).collect(),
            groups: criteria.groups.iter().map(|g| resolve_gid(g)).collect(),
            perms: criteria
                .perms
                .iter()
                .map(|p| ModeMask::parse(p))
                .collect::<Result<_>>()?,
            mtime: criteria.mtime,
            atime: criteria.atime,
            ctime: criteria.ctime,
            size: criteria.size,
            issymlinkto: anchored_all(&criteria.issymlinkto)?,
            exec_regex: criteria.exec_regex.as_deref().map(anchored).transpose()?,
            exec_program: criteria.exec_program.clone(),
            rule,
        })
    }

    /// Whether the file at `path` is selected.
    pub fn matches(&self, path: &Path, meta: &FileMetadata, probe: &Probe<'_>) -> bool {
        let flags = self.flags(path, meta, probe);

        let selected = match &self.rule {
            ResultRule::All => flags.iter().all(|(_, v)| *v),
            ResultRule::Any => flags.is_empty() || flags.iter().any(|(_, v)| *v),
            ResultRule::None => !flags.iter().any(|(_, v)| *v),
            ResultRule::Expr(expr) => expr.eval(&|name| {
                match flags.iter().find(|(flag, _)| *flag == name) {
                    Some((_, value)) => *value,
                    None => is_known_flag(name),
                }
            }),
        };

        tracing::trace!(path = %path.display(), ?flags, selected, "Selection evaluated");
        selected
    }

    /// Flags for every criterion that was actually specified.
    fn flags(&self, path: &Path, meta: &FileMetadata, probe: &Probe<'_>) -> Vec<(&'static str, bool)> {
        let mut flags = Vec::new();
        let leaf = leaf_name(path);
        let full = path.to_string_lossy();

        if !self.names.is_empty() {
            flags.push(("leaf_name", self.names.iter().any(|r| r.is_match(&leaf))));
        }
        if !self.paths.is_empty() {
            flags.push(("path_name", self.paths.iter().any(|r| r.is_match(&full))));
        }
        if !self.types.is_empty() {
            flags.push((
                "file_types",
                self.types.iter().any(|t| meta.file_type.matches_name(t)),
            ));
        }
        if !self.owners.is_empty() {
            flags.push(("owner", self.owners.contains(&Some(meta.uid))));
        }
        if !self.groups.is_empty() {
            flags.push(("group", self.groups.contains(&Some(meta.gid))));
        }
        if !self.perms.is_empty() {
            flags.push(("mode", self.perms.iter().any(|m| m.matches(meta.mode))));
        }
        if let Some(window) = self.mtime {
            flags.push(("mtime", window.contains(meta.mtime)));
        }
        if let Some(window) = self.atime {
            flags.push(("atime", window.contains(meta.atime)));
        }
        if let Some(window) = self.ctime {
            flags.push(("ctime", window.contains(meta.ctime)));
        }
        if let Some(window) = self.size {
            flags.push(("size", window.contains(meta.size)));
        }
        if !self.issymlinkto.is_empty() {
            let hit = meta.is_symlink()
                && (probe.read_link)(path).is_some_and(|target| {
                    let target = target.to_string_lossy();
                    self.issymlinkto.iter().any(|r| r.is_match(&target))
                });
            flags.push(("issymlinkto", hit));
        }
        if let Some(program) = &self.exec_program {
            let command = expand_promiser(program, path);
            let output = match probe.runner.run(&command) {
                Ok(output) => Some(output),
                Err(e) => {
                    tracing::warn!(command, error = %e, "Selection command failed");
                    None
                }
            };
            if let Some(regex) = &self.exec_regex {
                let hit = output
                    .as_ref()
                    .is_some_and(|o| o.lines.iter().any(|l| regex.is_match(l)));
                flags.push(("exec_regex", hit));
            }
            flags.push(("exec_program", output.is_some_and(|o| o.success())));
        }

        flags
    }
}

/// Flags a result expression may name. Unspecified known flags are set;
/// anything else is false.
fn is_known_flag(name: &str) -> bool {
    matches!(
        name,
        "leaf_name"
            | "path_name"
            | "file_types"
            | "owner"
            | "group"
            | "mode"
            | "mtime"
            | "atime"
            | "ctime"
            | "size"
            | "issymlinkto"
            | "exec_regex"
            | "exec_program"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, ShellRunner};
    use converge_fs::FileType;
    use proptest::prelude::*;
    use rstest::rstest;

    struct FixedRunner(CommandOutput);

    impl CommandRunner for FixedRunner {
        fn run(&self, _command: &str) -> Result<CommandOutput> {
            Ok(self.0.clone())
        }
    }

    fn meta(file_type: FileType, mode: u32, size: u64, mtime: i64) -> FileMetadata {
        FileMetadata {
            path: PathBuf::from("/data/report.log"),
            file_type,
            mode,
            uid: 0,
            gid: 0,
            size,
            atime: mtime,
            mtime,
            ctime: mtime,
            dev: 1,
            ino: 2,
            nlink: 1,
            rdev: 0,
        }
    }

    fn no_link(_: &Path) -> Option<PathBuf> {
        None
    }

    fn select(criteria: SelectionCriteria, meta: &FileMetadata) -> bool {
        let probe = Probe {
            read_link: &no_link,
            runner: &ShellRunner,
        };
        Selector::compile(&criteria)
            .unwrap()
            .matches(&meta.path.clone(), meta, &probe)
    }

    #[test]
    fn empty_criteria_select_everything() {
        let m = meta(FileType::Regular, 0o644, 10, 100);
        assert!(select(SelectionCriteria::default(), &m));
    }

    #[rstest]
    #[case(vec!["report\\.log"], true)]
    #[case(vec!["report"], false)]
    #[case(vec!["nope", ".*\\.log"], true)]
    fn leaf_names_are_anchored(#[case] names: Vec<&str>, #[case] expected: bool) {
        let m = meta(FileType::Regular, 0o644, 10, 100);
        let criteria = SelectionCriteria {
            names: names.into_iter().map(String::from).collect(),
            ..SelectionCriteria::default()
        };
        assert_eq!(select(criteria, &m), expected);
    }

    #[test]
    fn any_and_none_consider_only_specified_criteria() {
        let m = meta(FileType::Regular, 0o644, 10, 100);
        let criteria = SelectionCriteria {
            names: vec!["other".into()],
            types: vec!["plain".into()],
            ..SelectionCriteria::default()
        };

        let mut any = criteria.clone();
        any.result = Some("any".into());
        assert!(select(any, &m));

        let mut all = criteria.clone();
        all.result = Some("all".into());
        assert!(!select(all, &m));

        let mut none = criteria;
        none.result = Some("none".into());
        assert!(!select(none, &m));
    }

    #[test]
    fn expression_combines_flags() {
        let m = meta(FileType::Regular, 0o600, 10, 100);
        let criteria = SelectionCriteria {
            names: vec![".*\\.log".into()],
            perms: vec!["go-rwx".into()],
            size: Some(SizeWindow { min: 100, max: 200 }),
            result: Some("leaf_name.mode.!size".into()),
            ..SelectionCriteria::default()
        };
        assert!(select(criteria, &m));
    }

    #[test]
    fn unspecified_flag_in_expression_is_satisfied() {
        let m = meta(FileType::Regular, 0o600, 10, 100);
        let criteria = SelectionCriteria {
            result: Some("owner.mtime".into()),
            ..SelectionCriteria::default()
        };
        assert!(select(criteria, &m));
    }

    #[test]
    fn time_window_is_strict() {
        let m = meta(FileType::Regular, 0o600, 10, 100);
        let criteria = SelectionCriteria {
            mtime: Some(TimeWindow { from: 100, to: 200 }),
            ..SelectionCriteria::default()
        };
        assert!(!select(criteria, &m));
    }

    #[test]
    fn symlink_target_is_matched() {
        let m = meta(FileType::Symlink, 0o777, 10, 100);
        let criteria = SelectionCriteria {
            issymlinkto: vec!["/opt/.*".into()],
            ..SelectionCriteria::default()
        };
        let read_link = |_: &Path| Some(PathBuf::from("/opt/app/bin"));
        let probe = Probe {
            read_link: &read_link,
            runner: &ShellRunner,
        };
        assert!(Selector::compile(&criteria).unwrap().matches(&m.path.clone(), &m, &probe));
    }

    #[test]
    fn exec_criteria_use_output_and_status() {
        let m = meta(FileType::Regular, 0o600, 10, 100);
        let criteria = SelectionCriteria {
            exec_program: Some("file $(this.promiser)".into()),
            exec_regex: Some(".*ASCII text.*".into()),
            result: Some("exec_regex".into()),
            ..SelectionCriteria::default()
        };
        let runner = FixedRunner(CommandOutput {
            lines: vec!["/data/report.log: ASCII text".into()],
            status: Some(1),
        });
        let probe = Probe {
            read_link: &no_link,
            runner: &runner,
        };
        let selector = Selector::compile(&criteria).unwrap();
        assert!(selector.matches(&m.path.clone(), &m, &probe));

        let mut by_status = criteria;
        by_status.result = Some("exec_program".into());
        let selector = Selector::compile(&by_status).unwrap();
        assert!(!selector.matches(&m.path.clone(), &m, &probe));
    }

    #[test]
    fn bad_expression_is_an_error() {
        let criteria = SelectionCriteria {
            result: Some("leaf_name.(".into()),
            ..SelectionCriteria::default()
        };
        assert!(matches!(
            Selector::compile(&criteria),
            Err(Error::InvalidExpression { .. })
        ));
    }

    proptest! {
        /// With the `all` rule, leaving a criterion empty behaves exactly
        /// like specifying it with a pattern that matches everything.
        #[test]
        fn empty_criterion_equals_always_satisfied(
            use_names in any::<bool>(),
            use_paths in any::<bool>(),
            use_types in any::<bool>(),
            use_perms in any::<bool>(),
            use_size in any::<bool>(),
            mode in 0u32..0o7777,
            size in 0u64..10_000,
        ) {
            let m = meta(FileType::Regular, mode, size, 100);
            let full = SelectionCriteria {
                names: if use_names { vec![".*".into()] } else { vec![] },
                paths: if use_paths { vec!["/.*".into()] } else { vec![] },
                types: if use_types { vec!["reg".into()] } else { vec![] },
                perms: if use_perms { vec![format!("{mode:o}")] } else { vec![] },
                size: use_size.then_some(SizeWindow { min: 0, max: u64::MAX }),
                ..SelectionCriteria::default()
            };
            prop_assert!(select(full, &m));

            let narrowed = SelectionCriteria {
                names: vec!["never-matches".into()],
                paths: if use_paths { vec!["/.*".into()] } else { vec![] },
                ..SelectionCriteria::default()
            };
            prop_assert!(!select(narrowed, &m));
        }
    }
}
