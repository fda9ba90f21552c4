//! Request and response payloads of the client-facing operations, and the
//! argument vocabulary understood by the toolchain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRequest {
    pub source: String,
    /// Character offset for cursor based operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Ask for secondary artifacts such as a source map.
    #[serde(default)]
    pub return_extra: bool,
}

impl SourceRequest {
    pub fn new(source: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_extra(mut self) -> Self {
        self.return_extra = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisIssue {
    pub kind: IssueKind,
    pub line: usize,
    pub message: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub has_fixes: bool,
    pub char_start: usize,
    pub char_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResults {
    #[serde(default)]
    pub issues: Vec<AnalysisIssue>,
    /// Packages the snippet imports.
    #[serde(default)]
    pub package_imports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub completion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub relevance: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub replacement_offset: usize,
    pub replacement_length: usize,
    #[serde(default)]
    pub completions: Vec<Completion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEdit {
    pub offset: usize,
    pub length: usize,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFix {
    pub message: String,
    #[serde(default)]
    pub edits: Vec<SourceEdit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemAndFixes {
    pub problem_message: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub fixes: Vec<CandidateFix>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixesResponse {
    #[serde(default)]
    pub fixes: Vec<ProblemAndFixes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistsResponse {
    #[serde(default)]
    pub assists: Vec<CandidateFix>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatResponse {
    pub new_string: String,
    /// Cursor position mapped into the formatted text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    #[serde(default)]
    pub info: BTreeMap<String, String>,
}

/// Output of a successful compile. This is the value stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules_base_url: Option<String>,
}

/// The toolchain ran and rejected the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFailure {
    pub exit_code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CompileOutcome {
    Success(CompiledArtifact),
    Failure(ToolFailure),
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Success(_))
    }

    pub fn artifact(&self) -> Option<&CompiledArtifact> {
        match self {
            CompileOutcome::Success(artifact) => Some(artifact),
            CompileOutcome::Failure(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub service_version: String,
    pub toolchain_version: String,
    pub runtime_version: String,
    pub supported_packages: BTreeMap<String, String>,
}

/// Verbs understood by the persistent worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolVerb {
    Analyze,
    Complete,
    Fixes,
    Assists,
    Format,
    Document,
    CompileModular,
}

impl ToolVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolVerb::Analyze => "analyze",
            ToolVerb::Complete => "complete",
            ToolVerb::Fixes => "fixes",
            ToolVerb::Assists => "assists",
            ToolVerb::Format => "format",
            ToolVerb::Document => "document",
            ToolVerb::CompileModular => "compile-modular",
        }
    }

    /// Worker arguments for one request. Paths are absolute because one
    /// worker serves every workspace.
    pub fn arguments(&self, root: &Path, source: &Path, offset: Option<usize>) -> Vec<String> {
        let mut args = vec![
            self.as_str().to_string(),
            "--root".to_string(),
            root.display().to_string(),
        ];
        if let Some(offset) = offset {
            args.push("--offset".to_string());
            args.push(offset.to_string());
        }
        if *self == ToolVerb::CompileModular {
            args.push("--out".to_string());
            args.push(root.join("out").display().to_string());
        }
        args.push(source.display().to_string());
        args
    }
}

impl std::fmt::Display for ToolVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
