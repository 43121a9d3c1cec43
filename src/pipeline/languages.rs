//! Per-language toolchain table and host discovery.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::policy::MemoryEnforcement;

/// Replaced with the path of the source file in the workspace.
pub const SOURCE: &str = "{source}";
/// Replaced with the path of the compiled artifact.
pub const ARTIFACT: &str = "{artifact}";
/// Replaced with the workspace directory.
pub const WORKSPACE: &str = "{workspace}";

/// How one language is compiled and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    /// Canonical name.
    pub name: &'static str,
    /// Other accepted spellings.
    pub aliases: &'static [&'static str],
    /// File name the source is written to.
    pub source_file: &'static str,
    /// Compile argv template, `None` for interpreted languages.
    pub compile: Option<&'static [&'static str]>,
    /// Run argv template.
    pub run: &'static [&'static str],
    /// Timeout applied when the task does not set one.
    pub default_timeout: Duration,
    /// Memory enforcement for the run phase.
    pub memory: MemoryEnforcement,
    /// Floor for `max_processes` during the run phase (runtime threads count).
    pub min_processes: u64,
    /// Host variables forwarded into the sandbox when set.
    pub passthrough_env: &'static [&'static str],
    /// Fixed variables set for every run.
    pub env: &'static [(&'static str, &'static str)],
}

impl LanguageSpec {
    /// Whether a separate compile phase runs first.
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Host programs this language needs, in template order.
    pub fn programs(&self) -> Vec<&'static str> {
        let mut programs = Vec::new();
        let heads = self.compile.and_then(|c| c.first()).into_iter().chain(self.run.first());
        for head in heads {
            if !head.starts_with('{') && !programs.contains(head) {
                programs.push(*head);
            }
        }
        programs
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Every supported language.
pub static LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        name: "python",
        aliases: &["py", "python3"],
        source_file: "main.py",
        compile: None,
        run: &["python3", "-u", SOURCE],
        default_timeout: Duration::from_secs(30),
        memory: MemoryEnforcement::AddressSpace,
        min_processes: 1,
        passthrough_env: &[],
        env: &[("PYTHONIOENCODING", "utf-8"), ("PYTHONDONTWRITEBYTECODE", "1")],
    },
    LanguageSpec {
        name: "javascript",
        aliases: &["js", "node"],
        source_file: "main.js",
        compile: None,
        run: &["node", SOURCE],
        default_timeout: Duration::from_secs(30),
        memory: MemoryEnforcement::Resident,
        min_processes: 32,
        passthrough_env: &[],
        env: &[],
    },
    LanguageSpec {
        name: "shell",
        aliases: &["sh", "bash"],
        source_file: "main.sh",
        compile: None,
        run: &["sh", SOURCE],
        default_timeout: Duration::from_secs(30),
        memory: MemoryEnforcement::AddressSpace,
        min_processes: 16,
        passthrough_env: &[],
        env: &[],
    },
    LanguageSpec {
        name: "rust",
        aliases: &["rs"],
        source_file: "main.rs",
        compile: Some(&["rustc", "-O", "--edition=2021", SOURCE, "-o", ARTIFACT]),
        run: &[ARTIFACT],
        default_timeout: Duration::from_secs(120),
        memory: MemoryEnforcement::AddressSpace,
        min_processes: 1,
        passthrough_env: &["RUSTUP_HOME", "CARGO_HOME", "RUSTUP_TOOLCHAIN"],
        env: &[],
    },
    LanguageSpec {
        name: "cpp",
        aliases: &["c++", "cxx"],
        source_file: "main.cpp",
        compile: Some(&["g++", "-O2", "-std=c++17", SOURCE, "-o", ARTIFACT]),
        run: &[ARTIFACT],
        default_timeout: Duration::from_secs(90),
        memory: MemoryEnforcement::AddressSpace,
        min_processes: 1,
        passthrough_env: &[],
        env: &[],
    },
    LanguageSpec {
        name: "c",
        aliases: &[],
        source_file: "main.c",
        compile: Some(&["gcc", "-O2", "-std=c11", SOURCE, "-o", ARTIFACT, "-lm"]),
        run: &[ARTIFACT],
        default_timeout: Duration::from_secs(60),
        memory: MemoryEnforcement::AddressSpace,
        min_processes: 1,
        passthrough_env: &[],
        env: &[],
    },
    LanguageSpec {
        name: "go",
        aliases: &["golang"],
        source_file: "main.go",
        compile: None,
        run: &["go", "run", SOURCE],
        default_timeout: Duration::from_secs(45),
        memory: MemoryEnforcement::Resident,
        min_processes: 128,
        passthrough_env: &["GOROOT", "GOPATH"],
        env: &[("GOFLAGS", "-mod=mod"), ("CGO_ENABLED", "0")],
    },
    LanguageSpec {
        name: "java",
        aliases: &[],
        source_file: "Main.java",
        compile: Some(&["javac", "-d", WORKSPACE, SOURCE]),
        run: &["java", "-cp", WORKSPACE, "Main"],
        default_timeout: Duration::from_secs(60),
        memory: MemoryEnforcement::Resident,
        min_processes: 128,
        passthrough_env: &["JAVA_HOME"],
        env: &[],
    },
];

/// Look up a language by name or alias (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static LanguageSpec> {
    LANGUAGES.iter().find(|l| l.matches(name.trim()))
}

/// Default timeout for `language`, if known.
pub fn default_timeout(language: &str) -> Option<Duration> {
    lookup(language).map(|l| l.default_timeout)
}

/// Toolchains found on the host, resolved to absolute paths.
#[derive(Debug, Clone, Default)]
pub struct Toolchains {
    programs: HashMap<&'static str, PathBuf>,
}

impl Toolchains {
    /// Search the host `PATH` for every program in [`LANGUAGES`].
    pub fn discover() -> Self {
        let path = std::env::var_os("PATH").unwrap_or_default();
        let toolchains = Self::discover_in(&path);
        tracing::info!(
            languages = ?toolchains.available().iter().map(|l| l.name).collect::<Vec<_>>(),
            "discovered toolchains"
        );
        toolchains
    }

    /// Search `path` (a `PATH`-style list) for every program in [`LANGUAGES`].
    pub fn discover_in(path: &OsStr) -> Self {
        let mut programs = HashMap::new();
        for language in LANGUAGES {
            for program in language.programs() {
                if programs.contains_key(program) {
                    continue;
                }
                if let Some(found) = which(program, path) {
                    tracing::debug!(program, path = %found.display(), "found toolchain program");
                    programs.insert(program, found);
                }
            }
        }
        Self { programs }
    }

    /// Toolchains with an explicit program table, for tests and embedding.
    pub fn from_programs<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, P)>,
        P: Into<PathBuf>,
    {
        Self {
            programs: entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    /// Absolute path of `program`, if found.
    pub fn program(&self, program: &str) -> Option<&Path> {
        self.programs.get(program).map(PathBuf::as_path)
    }

    /// Whether every program `language` needs was found.
    pub fn supports(&self, language: &LanguageSpec) -> bool {
        language.programs().iter().all(|p| self.programs.contains_key(p))
    }

    /// Languages runnable on this host.
    pub fn available(&self) -> Vec<&'static LanguageSpec> {
        LANGUAGES.iter().filter(|l| self.supports(l)).collect()
    }
}

fn which(program: &str, path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path)
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
