#![allow(clippy::module_name_repetitions)]

//! Inbound command lines from the host computer.
//!
//! A single leading letter selects the command. The lexer uses `regal` to
//! produce a bounded token stream, and the parser composes `winnow`
//! combinators over those tokens. A line that fails to parse produces no
//! serial output; the returned error names the offending token so the caller
//! can log it.

use core::fmt;
use core::ops::Range;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
#[allow(deprecated)]
use winnow::error::ErrorKind;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::stream::Stream;

/// Maximum number of tokens in one command line.
pub const MAX_TOKENS: usize = 24;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Terminator the host appends to a session parameter reply.
pub const SESSION_PARAMS_END_MARKER: i64 = -1;

/// Lexical token kinds of the command channel.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Single command letter.
    #[regex(r"[A-Za-z]")]
    Letter,
    /// Optionally signed decimal integer.
    #[regex(r"-?[0-9]+")]
    Integer,
    #[token(",")]
    Comma,
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    /// Source text of the token.
    pub lexeme: &'a str,
    /// Byte range of `lexeme` within the line.
    pub span: Range<usize>,
}

/// Tokens of one line, in source order.
pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    /// The line holds more than [`MAX_TOKENS`] tokens.
    TooManyTokens { processed: usize },
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "token buffer exhausted after {processed} items")
            }
            LexError::Engine => write!(f, "lexer engine error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        found: Option<TokenKind>,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    InvalidInteger {
        span: Range<usize>,
    },
    UnknownCommand {
        lexeme: &'a str,
    },
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected,
                found,
                span,
            } => write!(f, "expected {expected}, found {found:?} at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::InvalidInteger { span } => {
                write!(f, "integer out of range at {span:?}")
            }
            GrammarErrorKind::UnknownCommand { lexeme } => write!(f, "unknown command `{lexeme}`"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    found: Some(tok.kind),
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn invalid_integer(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidInteger {
                span: token.span.clone(),
            },
        }
    }

    fn unknown_command(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::UnknownCommand {
                lexeme: token.lexeme,
            },
        }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

#[allow(deprecated)]
impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    fn from_error_kind(input: &Input<'src, 'slice>, _kind: ErrorKind) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn append(
        self,
        _input: &Input<'src, 'slice>,
        _token_start: &<Input<'src, 'slice> as Stream>::Checkpoint,
        _kind: ErrorKind,
    ) -> Self {
        self
    }

    fn or(self, other: Self) -> Self {
        other
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// Session state the host stored from an earlier `G,` dump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionParams {
    pub protocol: u8,
    pub stage: u8,
    pub daily_intake: u32,
    pub weekly_intake: u32,
}

/// Structured inbound commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// `T<unix-seconds>`
    SetTime(u64),
    /// `A...`, reserved for alarm editing.
    Alarm,
    /// `G`
    Globals,
    /// `S<protocol>,<stage>,<daily>,<weekly>[,-1]`
    SessionParams(SessionParams),
}

/// Tokenize one command line.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }

        let span = record.start..record.end;
        let lexeme = &line[span.clone()];
        if buffer
            .push(Token {
                kind: record.token,
                lexeme,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let start = partial.start;
        let span = start..start + partial.fragment.len();
        if buffer
            .push(Token {
                kind: TokenKind::Error,
                lexeme: partial.fragment,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    Ok(buffer)
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

/// Parse one inbound command line.
///
/// Everything after an `A` is accepted unchecked; every other command must
/// consume the whole line.
pub fn parse(line: &str) -> Result<Command, ParseError<'_>> {
    if line.starts_with('A') {
        return Ok(Command::Alarm);
    }

    let tokens = lex(line).map_err(ParseError::Lex)?;
    let mut input = tokens.as_slice();
    let command = match command().parse_next(&mut input) {
        Ok(command) => command,
        Err(ErrMode::Backtrack(err) | ErrMode::Cut(err)) => {
            return Err(ParseError::Grammar(err));
        }
        Err(ErrMode::Incomplete(_)) => {
            return Err(ParseError::Grammar(GrammarError::unexpected(
                "token",
                input.first(),
            )));
        }
    };

    while let Some((token, remaining)) = input.split_first() {
        if token.kind == TokenKind::Eol {
            input = remaining;
        } else {
            return Err(ParseError::Grammar(GrammarError::unexpected(
                "end of command",
                Some(token),
            )));
        }
    }

    Ok(command)
}

fn command<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, Command, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let letter = expect_kind(TokenKind::Letter, "command letter").parse_next(input)?;
        match letter.lexeme {
            "T" => {
                let seconds = integer::<u64>("unix seconds").parse_next(input)?;
                Ok(Command::SetTime(seconds))
            }
            "G" => Ok(Command::Globals),
            "S" => session_params().parse_next(input).map(Command::SessionParams),
            _ => Err(ErrMode::Cut(GrammarError::unknown_command(&letter))),
        }
    }
}

fn session_params<'src, 'slice>()
-> impl Parser<Input<'src, 'slice>, SessionParams, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let protocol = integer::<u8>("protocol").parse_next(input)?;
        expect_kind(TokenKind::Comma, ",").parse_next(input)?;
        let stage = integer::<u8>("stage").parse_next(input)?;
        expect_kind(TokenKind::Comma, ",").parse_next(input)?;
        let daily_intake = integer::<u32>("daily intake").parse_next(input)?;
        expect_kind(TokenKind::Comma, ",").parse_next(input)?;
        let weekly_intake = integer::<u32>("weekly intake").parse_next(input)?;

        if let Some((comma, rest)) = input.split_first()
            && comma.kind == TokenKind::Comma
        {
            *input = rest;
            let marker = expect_kind(TokenKind::Integer, "end marker").parse_next(input)?;
            if marker.lexeme.parse::<i64>() != Ok(SESSION_PARAMS_END_MARKER) {
                return Err(ErrMode::Cut(GrammarError::unexpected(
                    "end marker",
                    Some(&marker),
                )));
            }
        }

        Ok(SessionParams {
            protocol,
            stage,
            daily_intake,
            weekly_intake,
        })
    }
}

fn integer<'src, 'slice, T>(
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, T, GrammarError<'src>>
where
    'src: 'slice,
    T: core::str::FromStr,
{
    move |input: &mut Input<'src, 'slice>| {
        let token = expect_kind(TokenKind::Integer, label).parse_next(input)?;
        token
            .lexeme
            .parse::<T>()
            .map_err(|_| ErrMode::Cut(GrammarError::invalid_integer(&token)))
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            Some(token),
        ))),
        None => Err(ErrMode::Backtrack(GrammarError::unexpected(label, None))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Command {
        parse(input).expect("command should parse")
    }

    #[test]
    fn parses_time_sync() {
        assert_eq!(parse_ok("T1506298500"), Command::SetTime(1_506_298_500));
        assert_eq!(parse_ok("T1506298500\r\n"), Command::SetTime(1_506_298_500));
    }

    #[test]
    fn alarm_prefix_is_accepted_unchecked() {
        assert_eq!(parse_ok("A"), Command::Alarm);
        assert_eq!(parse_ok("A19,40,$"), Command::Alarm);
    }

    #[test]
    fn parses_globals_request() {
        assert_eq!(parse_ok("G"), Command::Globals);
    }

    #[test]
    fn parses_session_params_with_and_without_marker() {
        let expected = Command::SessionParams(SessionParams {
            protocol: 0,
            stage: 3,
            daily_intake: 120,
            weekly_intake: 480,
        });
        assert_eq!(parse_ok("S0,3,120,480,-1"), expected);
        assert_eq!(parse_ok("S0, 3, 120, 480"), expected);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse("T").is_err());
        assert!(parse("Tabc").is_err());
        assert!(parse("T-5").is_err());
        assert!(parse("S0,3,120").is_err());
        assert!(parse("S0,3,120,480,7").is_err());
        assert!(parse("S300,0,0,0").is_err());
        assert!(parse("X12").is_err());
        assert!(parse("G extra").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn errors_point_at_the_offending_token() {
        let unknown = parse("X12").expect_err("unknown letter");
        assert_eq!(
            unknown,
            ParseError::Grammar(GrammarError {
                kind: GrammarErrorKind::UnknownCommand { lexeme: "X" },
            })
        );

        let mut text: heapless::String<64> = heapless::String::new();
        core::fmt::write(&mut text, format_args!("{unknown}")).expect("format error");
        assert_eq!(text.as_str(), "unknown command `X`");

        let overflow = parse("S300,0,0,0").expect_err("protocol exceeds u8");
        assert_eq!(
            overflow,
            ParseError::Grammar(GrammarError {
                kind: GrammarErrorKind::InvalidInteger { span: 1..4 },
            })
        );
        text.clear();
        core::fmt::write(&mut text, format_args!("{overflow}")).expect("format error");
        assert_eq!(text.as_str(), "integer out of range at 1..4");
    }

    #[test]
    fn overlong_lines_exhaust_the_token_buffer() {
        let line = "S0,0,0,0,0,0,0,0,0,0,0,0,0,0,0";
        assert!(matches!(
            parse(line),
            Err(ParseError::Lex(LexError::TooManyTokens { .. }))
        ));
    }

    #[test]
    fn lexer_splits_letter_from_digits() {
        let tokens = lex("T42").expect("lexing should succeed");
        let kinds: HeaplessVec<TokenKind, 4> = tokens.iter().map(|token| token.kind).collect();
        assert_eq!(kinds.as_slice(), &[TokenKind::Letter, TokenKind::Integer]);
        assert_eq!(tokens[1].lexeme, "42");
    }
}
