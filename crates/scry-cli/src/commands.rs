//! Controller commands read from stdin while a session runs.

use anyhow::{anyhow, bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Continue,
    StepOver,
    StepInto,
    StepOut,
    /// Create the breakpoint if absent, otherwise flip it on or off.
    Toggle { class: String, line: u32 },
    List,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  c, continue        resume until the next breakpoint
  n, next, over      step over
  s, step, into      step into
  o, out             step out
  b CLASS:LINE       toggle a breakpoint
  bl                 list breakpoints
  h, help            this text
  q, quit            stop the session";

/// Parses one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match verb {
        "c" | "continue" => Command::Continue,
        "n" | "next" | "over" => Command::StepOver,
        "s" | "step" | "into" => Command::StepInto,
        "o" | "out" => Command::StepOut,
        "bl" => Command::List,
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" => Command::Quit,
        "b" | "break" => {
            let [location] = rest.as_slice() else {
                bail!("usage: b CLASS:LINE");
            };
            let (class, line) = parse_location(location)?;
            return Ok(Some(Command::Toggle { class, line }));
        }
        other => bail!("unknown command `{other}` (try `help`)"),
    };
    if !rest.is_empty() {
        bail!("`{verb}` takes no arguments");
    }
    Ok(Some(command))
}

/// Splits `com.example.Main:42`.
pub fn parse_location(text: &str) -> Result<(String, u32)> {
    let (class, line) = text
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected CLASS:LINE, got `{text}`"))?;
    if class.is_empty() {
        bail!("missing class name in `{text}`");
    }
    let line: u32 = line
        .parse()
        .with_context(|| format!("invalid line number in `{text}`"))?;
    if line == 0 {
        bail!("line numbers start at 1");
    }
    Ok((class.to_string(), line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms_agree() {
        for (input, expected) in [
            ("c", Command::Continue),
            ("continue", Command::Continue),
            ("n", Command::StepOver),
            ("next", Command::StepOver),
            ("over", Command::StepOver),
            ("s", Command::StepInto),
            ("step", Command::StepInto),
            ("into", Command::StepInto),
            ("o", Command::StepOut),
            ("out", Command::StepOut),
            ("bl", Command::List),
            ("q", Command::Quit),
            ("quit", Command::Quit),
        ] {
            assert_eq!(parse(input).unwrap(), Some(expected), "{input}");
        }
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   \t").unwrap(), None);
    }

    #[test]
    fn breakpoint_commands_take_a_location() {
        assert_eq!(
            parse("  b demo.GeneratorTarget:15 ").unwrap(),
            Some(Command::Toggle {
                class: "demo.GeneratorTarget".into(),
                line: 15,
            })
        );
        assert!(parse("b").is_err());
        assert!(parse("b demo.Main").is_err());
        assert!(parse("b demo.Main:0").is_err());
        assert!(parse("b :3").is_err());
        assert!(parse("b demo.Main:3 extra").is_err());
    }

    #[test]
    fn nested_class_names_keep_their_dollar() {
        assert_eq!(
            parse_location("demo.Outer$Inner:7").unwrap(),
            ("demo.Outer$Inner".to_string(), 7)
        );
    }

    #[test]
    fn unknown_verbs_and_stray_arguments_are_rejected() {
        let err = parse("jump 3").unwrap_err();
        assert!(err.to_string().contains("unknown command"), "{err}");
        assert!(parse("c now").is_err());
    }
}
