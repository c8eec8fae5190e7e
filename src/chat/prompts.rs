//! System instructions sent ahead of agent-mode requests.

/// Marker string delimiting each runnable program in a streamed response.
/// Chosen so it never appears in normal prose or code.
pub const SENTINEL: &str = "!@!@!@!";

const FENCE: &str = "````";

/// Instructions that teach the model the sentinel/fence contract the
/// extractor parses.
pub fn agent_instructions() -> String {
    format!(
        "\
You are an AI coding agent. When the user asks for changes such as file \
creation or modification, you MUST generate Python code that can be \
executed to perform those changes. The code you generate MUST:

- Be enclosed exactly once at the beginning and once at the end with {sentinel}, \
with no other usages of {sentinel} inside or outside the code.
- Be syntactically correct and executable as a Python file.
- Use only Python.
- Use necessary imports and no unnecessary ones. If a package is needed but \
not installed, generate a Python function within the code to install it.
- When modifying or creating files, use the environment variable \
'BASE_WORKSPACE_PATH' for file paths so they land in the right directory, \
defaulting to the current directory ('.').
- If multiple steps or programs are needed, split them into multiple Python \
programs, each enclosed separately following the rules above.
- When commands must be executed, use shell execution from within Python.
- Provide a short explanation (no more than four sentences) after the code.
- Inside the {sentinel} markers, also wrap the code in {fence_len} backticks:

  {sentinel}
  {fence}python
  # your python code
  {fence}
  {sentinel}

- The user's operating system is {os}, if platform-dependent concerns arise.

Double-check that you follow these rules exactly before streaming your \
response.",
        sentinel = SENTINEL,
        fence = FENCE,
        fence_len = FENCE.len(),
        os = std::env::consts::OS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instructions_state_the_wire_contract() {
        let prompt = agent_instructions();
        assert!(prompt.contains(SENTINEL));
        assert!(prompt.contains("````python"));
        assert!(prompt.contains("BASE_WORKSPACE_PATH"));
    }
}
