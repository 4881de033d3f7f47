// https://github.com/Geal/nom/blob/master/doc/choosing_a_combinator.md

use nom::{
    bytes::complete::{take_till, take_till1, take_while},
    character::complete::char,
    combinator::all_consuming,
    multi::{many0, separated_list1},
    sequence::{preceded, terminated},
    IResult,
};

use crate::error::ShellError;

/// Splits a line into the argument lists of its pipeline stages.
///
/// An empty segment anywhere rejects the whole line. A line without any
/// tokens yields no stages.
pub(crate) fn segment(line: &str) -> Result<Vec<Vec<String>>, ShellError> {
    let (_, raw_segments) = split_pipes(line).map_err(|_| ShellError::Syntax)?;

    // a single blank segment is a blank line, not a dangling pipe
    if raw_segments.len() > 1 && raw_segments.iter().any(|s| s.trim().is_empty()) {
        return Err(ShellError::Syntax);
    }

    let mut segments = Vec::with_capacity(raw_segments.len());
    for raw in raw_segments {
        let (_, argv) = all_consuming(words)(raw).map_err(|_| ShellError::Syntax)?;
        if argv.is_empty() {
            continue;
        }
        segments.push(argv.into_iter().map(String::from).collect());
    }

    Ok(segments)
}

fn split_pipes(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list1(char('|'), take_till(|c: char| c == '|'))(input)
}

// separators and token boundaries must agree on what whitespace is
fn blanks(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c.is_whitespace())(input)
}

fn words(input: &str) -> IResult<&str, Vec<&str>> {
    terminated(
        many0(preceded(blanks, take_till1(|c: char| c.is_whitespace()))),
        blanks,
    )(input)
}
