use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// directive prefix of batch script header lines
pub const DIRECTIVE_PREFIX: &str = "#SBATCH";
/// placeholder replaced by the job id
pub const JOB_ID_PLACEHOLDER: &str = "%j";
/// array master id placeholder, identical to the job id for plain jobs
pub const ARRAY_ID_PLACEHOLDER: &str = "%A";
pub const DEFAULT_OUTPUT_PATTERN: &str = "slurm-%j.out";

/// File name template where a job's output is expected to appear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPattern(String);

impl OutputPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Scan the script header for an output directive, falling back to `slurm-%j.out`.
    ///
    /// Accepted spellings: `#SBATCH --output=<p>`, `#SBATCH --output <p>` and `#SBATCH -o <p>`.
    /// The first matching line wins.
    pub fn from_script(script: &str) -> Self {
        script
            .lines()
            .find_map(parse_output_directive)
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// substitute the job id placeholders
    pub fn resolve(&self, job_id: &str) -> String {
        self.0
            .replace(JOB_ID_PLACEHOLDER, job_id)
            .replace(ARRAY_ID_PLACEHOLDER, job_id)
    }
}

impl Default for OutputPattern {
    fn default() -> Self {
        Self(DEFAULT_OUTPUT_PATTERN.to_string())
    }
}

impl fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_output_directive(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(DIRECTIVE_PREFIX)?;
    // the directive must be followed by whitespace, `#SBATCHX` is a comment
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();

    let value = if let Some(value) = rest.strip_prefix("--output=") {
        value
    } else if let Some(value) = rest.strip_prefix("--output ") {
        value
    } else if let Some(value) = rest.strip_prefix("-o ") {
        value
    } else {
        return None;
    };

    // strip inline comments and surrounding quotes
    let value = value.split_whitespace().next()?;
    let value = value.trim_matches(|c| c == '"' || c == '\'');

    (!value.is_empty()).then(|| value.to_string())
}

fn is_language_tag(line: &str) -> bool {
    let tag = line.trim();
    !tag.contains(char::is_whitespace) && !tag.starts_with('#')
}

static SCRIPT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique file name for an uploaded script: `job_<unix seconds>_<sequence>.sh`
pub fn remote_script_name() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    format!(
        "job_{seconds}_{}.sh",
        SCRIPT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
    )
}

/// A model response split into its explanation and the script it contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedScript {
    pub reasoning: Option<String>,
    pub script: String,
}

/// Split a markdown response into reasoning and script.
///
/// Text before the first code fence is taken as reasoning when the response carries a
/// `Reasoning:` marker. The script is the body of the first ```` ```bash ```` fence, otherwise the
/// first plain fence, otherwise the whole (non reasoning) text.
pub fn extract_script(response: &str) -> ExtractedScript {
    let response = response.trim();

    let (reasoning, body) = if response.contains("Reasoning:") {
        match response.split_once("```") {
            Some((before, after)) => (
                Some(before.replace("Reasoning:", "").trim().to_string()),
                format!("```{after}"),
            ),
            None => (
                Some(response.replace("Reasoning:", "").trim().to_string()),
                String::new(),
            ),
        }
    } else {
        (None, response.to_string())
    };

    let script = if let Some((_, rest)) = body.split_once("```bash") {
        rest.split("```").next().unwrap_or_default()
    } else if let Some((_, rest)) = body.split_once("```") {
        let fenced = rest.split("```").next().unwrap_or_default();
        // drop a language tag such as ```sh
        match fenced.split_once('\n') {
            Some((tag, code)) if is_language_tag(tag) => code,
            _ => fenced,
        }
    } else {
        body.as_str()
    };

    ExtractedScript {
        reasoning: reasoning.filter(|reasoning| !reasoning.is_empty()),
        script: script.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_output_directive() {
        let script = "#!/bin/bash\n#SBATCH --job-name=x\n#SBATCH --output=custom-%j.log\necho hi\n";
        let pattern = OutputPattern::from_script(script);

        assert_eq!(pattern.as_str(), "custom-%j.log");
        assert_eq!(pattern.resolve("77"), "custom-77.log");
    }

    #[test]
    fn default_output_pattern() {
        let pattern = OutputPattern::from_script("#!/bin/bash\necho hi\n");

        assert_eq!(pattern, OutputPattern::default());
        assert_eq!(pattern.resolve("77"), "slurm-77.out");
    }

    #[test]
    fn alternative_directive_spellings() {
        assert_eq!(
            OutputPattern::from_script("#SBATCH -o logs/%j.txt").as_str(),
            "logs/%j.txt"
        );
        assert_eq!(
            OutputPattern::from_script("  #SBATCH --output \"run-%A.out\"  # stdout").as_str(),
            "run-%A.out"
        );
        assert_eq!(OutputPattern::from_script("#SBATCH --output=a-%A.out").resolve("5"), "a-5.out");
    }

    #[test]
    fn first_directive_wins_and_comments_are_ignored() {
        let script = "#SBATCHX --output=nope\n# SBATCH --output=nope\n\
                      #SBATCH --output=first.out\n#SBATCH --output=second.out\n";

        assert_eq!(OutputPattern::from_script(script).as_str(), "first.out");
    }

    #[test]
    fn script_names_are_unique() {
        let first = remote_script_name();
        let second = remote_script_name();

        assert_ne!(first, second);
        assert!(first.starts_with("job_") && first.ends_with(".sh"));
    }

    #[test]
    fn extract_bash_fence_with_reasoning() {
        let response = "Reasoning: print a value with python.\n\n\
                        ```bash\n#!/bin/bash\n#SBATCH --time=00:05:00\n\
                        python3 -c \"print(42)\"\n```\n\
                        Done.";
        let extracted = extract_script(response);

        assert_eq!(
            extracted.reasoning.as_deref(),
            Some("print a value with python.")
        );
        assert_eq!(
            extracted.script,
            "#!/bin/bash\n#SBATCH --time=00:05:00\npython3 -c \"print(42)\""
        );
    }

    #[test]
    fn extract_plain_fence_and_bare_text() {
        let fenced = extract_script("```sh\necho hi\n```");
        assert_eq!(fenced.reasoning, None);
        assert_eq!(fenced.script, "echo hi");

        let bare = extract_script("#!/bin/bash\necho hi\n");
        assert_eq!(bare.script, "#!/bin/bash\necho hi");

        let shebang_fence = extract_script("```\n#!/bin/bash\necho hi\n```");
        assert_eq!(shebang_fence.script, "#!/bin/bash\necho hi");
    }
}
