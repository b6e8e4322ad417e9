//! Shell command analysis: wrapper extraction and segment decomposition.
//!
//! The tokenizer is deliberately narrower than a real shell grammar.
//! Anything it cannot see through — substitutions, heredocs, unterminated
//! quotes — fails analysis (`ok=false`) rather than being guessed at, and
//! the policy layer treats unanalyzable commands as untrusted.

use crate::command::{AnalyzedCommand, Redirection, Segment, ShellOperator};
use std::iter::Peekable;
use std::str::Chars;

const POSIX_SHELLS: &[&str] = &["sh", "bash", "dash", "zsh"];

fn basename(program: &str) -> &str {
    program.rsplit(['/', '\\']).next().unwrap_or(program)
}

/// Extract the embedded command string from a recognized shell-wrapper argv.
///
/// POSIX form: `sh|bash|dash|zsh -c|-lc <command> [args...]` returns
/// `<command>` (further entries are dollar-positional args).
///
/// Windows form: `cmd`/`cmd.exe` with a `/c` or `/k` flag returns every
/// following token joined by a single space. cmd.exe receives those tokens
/// as one command line, so the gatekeeper must see the entire concatenation.
pub fn extract_shell_command_from_argv(argv: &[String]) -> Option<String> {
    let first = argv.first()?;
    let base = basename(first);

    if POSIX_SHELLS.contains(&base)
        && argv.len() >= 3
        && matches!(argv[1].as_str(), "-c" | "-lc")
    {
        return Some(argv[2].clone());
    }

    let base_lower = base.to_ascii_lowercase();
    if base_lower == "cmd" || base_lower == "cmd.exe" {
        let flag_idx = argv.iter().enumerate().skip(1).find_map(|(i, arg)| {
            let lower = arg.to_ascii_lowercase();
            (lower == "/c" || lower == "/k").then_some(i)
        });
        if let Some(i) = flag_idx
            && argv.len() > i + 1
        {
            return Some(argv[i + 1..].join(" "));
        }
    }

    None
}

/// Whether this argv's program is a `cmd`/`cmd.exe` invocation.
pub fn is_cmd_exe(argv: &[String]) -> bool {
    argv.first().is_some_and(|p| {
        let base = basename(p).to_ascii_lowercase();
        base == "cmd" || base == "cmd.exe"
    })
}

/// Split a shell command string into segments and operators.
pub fn parse_shell(command: &str) -> AnalyzedCommand {
    let mut parser = ShellParser::new(command);
    parser.run();
    parser.finish()
}

#[derive(Default)]
struct Token {
    text: String,
    started: bool,
    quoted: bool,
    glob: bool,
}

struct ShellParser<'a> {
    chars: Peekable<Chars<'a>>,
    ok: bool,
    segments: Vec<Segment>,
    operators: Vec<ShellOperator>,
    tokens: Vec<Token>,
    redirections: Vec<Redirection>,
    token: Token,
    pending_redirect: Option<String>,
    segment_since_operator: bool,
}

impl<'a> ShellParser<'a> {
    fn new(command: &'a str) -> Self {
        Self {
            chars: command.chars().peekable(),
            ok: true,
            segments: Vec::new(),
            operators: Vec::new(),
            tokens: Vec::new(),
            redirections: Vec::new(),
            token: Token::default(),
            pending_redirect: None,
            segment_since_operator: false,
        }
    }

    fn fail(&mut self) {
        self.ok = false;
    }

    fn push_char(&mut self, c: char) {
        self.token.started = true;
        self.token.text.push(c);
        if matches!(c, '*' | '?' | '[') {
            self.token.glob = true;
        }
    }

    /// Push without glob-marking, for quoted/escaped characters.
    fn push_literal(&mut self, c: char) {
        self.token.started = true;
        self.token.text.push(c);
    }

    fn has_pending(&self) -> bool {
        self.token.started || !self.tokens.is_empty() || !self.redirections.is_empty()
    }

    fn end_token(&mut self) {
        if !self.token.started {
            return;
        }
        let token = std::mem::take(&mut self.token);
        if let Some(op) = self.pending_redirect.take() {
            self.redirections.push(Redirection {
                op,
                target: Some(token.text),
            });
        } else {
            self.tokens.push(token);
        }
    }

    fn end_segment(&mut self, operator: Option<ShellOperator>) {
        self.end_token();
        if let Some(op) = self.pending_redirect.take() {
            // Dangling redirection ("echo >") cannot be analyzed
            self.redirections.push(Redirection { op, target: None });
            self.fail();
        }

        let has_content = !self.tokens.is_empty() || !self.redirections.is_empty();
        if has_content {
            match self.tokens.first() {
                Some(first) => {
                    // A variable assignment or glob in program position hides
                    // the real program from analysis
                    if (!first.quoted && is_assignment(&first.text)) || first.glob {
                        self.fail();
                    }
                }
                // Redirection with no program ("> file")
                None => self.fail(),
            }
            let argv = self.tokens.drain(..).map(|t| t.text).collect();
            self.segments.push(Segment {
                argv,
                redirections: std::mem::take(&mut self.redirections),
                resolution: None,
            });
            self.segment_since_operator = true;
        }

        if let Some(op) = operator {
            if op != ShellOperator::Subshell && !has_content && !self.segment_since_operator {
                // Leading or doubled operator ("| foo", "a ;; b")
                self.fail();
            }
            self.operators.push(op);
            self.segment_since_operator = false;
        }
    }

    fn read_single_quoted(&mut self) {
        self.token.started = true;
        self.token.quoted = true;
        loop {
            match self.chars.next() {
                Some('\'') => return,
                Some(c) => self.push_literal(c),
                None => {
                    self.fail();
                    return;
                }
            }
        }
    }

    fn read_double_quoted(&mut self) {
        self.token.started = true;
        self.token.quoted = true;
        loop {
            match self.chars.next() {
                Some('"') => return,
                Some('\\') => match self.chars.peek().copied() {
                    Some(n @ ('"' | '\\' | '$' | '`')) => {
                        self.push_literal(n);
                        self.chars.next();
                    }
                    _ => self.push_literal('\\'),
                },
                Some('$') => {
                    // Substitution expands even inside double quotes
                    if matches!(self.chars.peek(), Some('(' | '{')) {
                        self.fail();
                        return;
                    }
                    self.push_literal('$');
                }
                Some('`') => {
                    self.fail();
                    return;
                }
                Some(c) => self.push_literal(c),
                None => {
                    self.fail();
                    return;
                }
            }
        }
    }

    fn start_redirect(&mut self, mut op: String, direction: char) {
        if self.pending_redirect.is_some() {
            // "echo > > out"
            self.fail();
            return;
        }
        if self.chars.peek() == Some(&direction) {
            self.chars.next();
            op.push(direction);
            if direction == '<' {
                // Heredoc bodies are free text; analysis cannot follow them
                self.fail();
                return;
            }
        }
        // fd duplication: "2>&1", ">&2"
        if self.chars.peek() == Some(&'&') {
            self.chars.next();
            op.push('&');
        }
        self.pending_redirect = Some(op);
    }

    fn on_redirect_char(&mut self, c: char) {
        if self.chars.peek() == Some(&'(') {
            // Process substitution <(...) / >(...)
            self.fail();
            return;
        }
        // A bare-digit token directly before the operator is its fd prefix
        let mut op = String::new();
        if self.token.started
            && !self.token.quoted
            && self.token.text.chars().all(|d| d.is_ascii_digit())
        {
            op = std::mem::take(&mut self.token).text;
        } else {
            self.end_token();
        }
        op.push(c);
        self.start_redirect(op, c);
    }

    fn skip_comment(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                return;
            }
            self.chars.next();
        }
    }

    fn run(&mut self) {
        while let Some(c) = self.chars.next() {
            if !self.ok {
                return;
            }
            match c {
                '\'' => self.read_single_quoted(),
                '"' => self.read_double_quoted(),
                '\\' => match self.chars.next() {
                    // Line continuation joins as whitespace
                    Some('\n') => self.end_token(),
                    Some(n) => self.push_literal(n),
                    None => self.fail(),
                },
                ' ' | '\t' | '\r' => self.end_token(),
                '\n' => {
                    if self.has_pending() {
                        self.end_segment(Some(ShellOperator::Semicolon));
                    }
                }
                ';' => self.end_segment(Some(ShellOperator::Semicolon)),
                '|' => {
                    if self.chars.peek() == Some(&'|') {
                        self.chars.next();
                        self.end_segment(Some(ShellOperator::Or));
                    } else {
                        self.end_segment(Some(ShellOperator::Pipe));
                    }
                }
                '&' => match self.chars.peek() {
                    Some('&') => {
                        self.chars.next();
                        self.end_segment(Some(ShellOperator::And));
                    }
                    Some('>') => {
                        self.chars.next();
                        self.end_token();
                        self.start_redirect("&>".to_string(), '>');
                    }
                    _ => self.end_segment(Some(ShellOperator::Background)),
                },
                '>' | '<' => self.on_redirect_char(c),
                '(' => self.end_segment(Some(ShellOperator::Subshell)),
                ')' => self.end_segment(None),
                '$' => match self.chars.peek() {
                    // $(...) and ${...} can execute or hide anything
                    Some('(' | '{') => self.fail(),
                    _ => self.push_literal('$'),
                },
                '`' => self.fail(),
                '#' if !self.token.started => self.skip_comment(),
                _ => self.push_char(c),
            }
        }
    }

    fn finish(mut self) -> AnalyzedCommand {
        if self.ok {
            self.end_segment(None);
        }
        if self.segments.is_empty() {
            self.ok = false;
        }
        AnalyzedCommand {
            ok: self.ok,
            segments: self.segments,
            operators: self.operators,
        }
    }
}

fn is_assignment(token: &str) -> bool {
    match token.find('=') {
        Some(0) | None => false,
        Some(eq) => {
            let name = &token[..eq];
            let mut chars = name.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
    }
}
