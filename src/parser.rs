use chrono::{DateTime, Utc};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until, take_while},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map_res, opt, recognize, value},
    multi::separated_list1,
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};

use crate::query::VisitFilter;

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Populate { path: String },
    LastKnown,
    Visits(VisitFilter),
    Metadata,
    Compact,
    PurgeTesting,
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_float(input: &str) -> IResult<&str, f64> {
    let (input, num_str) = recognize(tuple((
        opt(alt((char('-'), char('+')))),
        digit1,
        opt(tuple((char('.'), digit1))),
    )))(input)?;
    match num_str.parse::<f64>() {
        Ok(n) => Ok((input, n)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))),
    }
}

fn parse_i64(input: &str) -> IResult<&str, i64> {
    map_res(digit1, |s: &str| s.parse::<i64>())(input)
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let double = delimited(char('"'), take_until("\""), char('"'));
    let single = delimited(char('\''), take_until("'"), char('\''));
    let (input, content) = alt((double, single))(input)?;
    Ok((input, content.to_string()))
}

fn parse_quoted_list(input: &str) -> IResult<&str, Vec<String>> {
    separated_list1(tuple((multispace0, char(','), multispace0)), parse_quoted_string)(input)
}

/// `(lat, lng)`
fn parse_corner(input: &str) -> IResult<&str, Vec<f64>> {
    let (input, (lat, lng)) = delimited(
        ws(char('(')),
        separated_pair(parse_float, ws(char(',')), parse_float),
        ws(char(')')),
    )(input)?;
    Ok((input, vec![lat, lng]))
}

fn parse_unix_time(input: &str) -> IResult<&str, DateTime<Utc>> {
    let (rest, secs) = parse_i64(input)?;
    match DateTime::<Utc>::from_timestamp(secs, 0) {
        Some(t) => Ok((rest, t)),
        None => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit))),
    }
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

// --- COMMAND PARSERS ---

fn parse_populate(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("POPULATE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, path) = parse_quoted_string(input)?;
    Ok((input, Command::Populate { path }))
}

fn parse_last_known(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((
        tag_ci("LASTKNOWN"),
        recognize(tuple((tag_ci("LAST"), multispace1, tag_ci("KNOWN")))),
    ))(input)?;
    Ok((input, Command::LastKnown))
}

fn parse_visits(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("VISITS")(input)?;
    let (input, _) = opt(ws(tag_ci("WHERE")))(input)?;

    let (input, bbox) = opt(preceded(
        tuple((ws(tag_ci("IN")), ws(tag_ci("BBOX")))),
        tuple((parse_corner, parse_corner)),
    ))(input)?;

    let (input, names) = opt(preceded(ws(tag_ci("NAMES")), parse_quoted_list))(input)?;
    let (input, uuids) = opt(preceded(ws(tag_ci("UUIDS")), parse_quoted_list))(input)?;
    let (input, since) = opt(preceded(ws(tag_ci("SINCE")), parse_unix_time))(input)?;
    let (input, until) = opt(preceded(ws(tag_ci("UNTIL")), parse_unix_time))(input)?;

    let (input, page) = opt(preceded(
        ws(tag_ci("PAGE")),
        separated_pair(parse_i64, tag(".."), parse_i64),
    ))(input)?;

    let (input, reverse) = opt(ws(tag_ci("REVERSE")))(input)?;

    let (bbox_sw, bbox_ne) = match bbox {
        Some((sw, ne)) => (Some(sw), Some(ne)),
        None => (None, None),
    };
    let (start_index, end_index) = page.unwrap_or((0, 0));

    let filter = VisitFilter {
        uuids: uuids.unwrap_or_default(),
        names: names.unwrap_or_default(),
        start_reported: since,
        end_reported: until,
        reverse_chrono: reverse.is_some(),
        start_index,
        end_index,
        bbox_sw,
        bbox_ne,
        ..Default::default()
    };
    Ok((input, Command::Visits(filter)))
}

fn parse_keyword_command(input: &str) -> IResult<&str, Command> {
    alt((
        value(Command::Metadata, tag_ci("METADATA")),
        value(Command::Compact, tag_ci("COMPACT")),
        value(
            Command::PurgeTesting,
            tuple((tag_ci("PURGE"), multispace1, tag_ci("TESTING"))),
        ),
        value(Command::Help, tag_ci("HELP")),
        value(Command::Exit, alt((tag_ci("EXIT"), tag_ci("QUIT")))),
    ))(input)
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_populate,
        parse_last_known,
        parse_visits,
        parse_keyword_command,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context = if e.input.chars().count() > 20 {
                format!("{}...", e.input.chars().take(20).collect::<String>())
            } else {
                e.input.to_string()
            };
            Err(format!("Invalid syntax near: '{}'", context))
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}

fn parse_place(input: &str) -> IResult<&str, (f64, f64)> {
    let (input, _) = take_until("<")(input)?;
    let (input, _) = char('<')(input)?;
    let (input, _) = take_while(|c: char| c == ' ')(input)?;
    let (input, pair) = separated_pair(parse_float, ws(char(',')), parse_float)(input)?;
    let (input, _) = char('>')(input)?;
    Ok((input, pair))
}

/// Extracts `(lat, lng)` from a device place description such as
/// `"25 Yeadon Ave @ <+32.78044829,-79.98285770> +/- 100.00m"`.
pub fn parse_place_coordinates(place: &str) -> Result<(f64, f64), String> {
    match parse_place(place) {
        Ok((_, (lat, lng))) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) => {
            Ok((lat, lng))
        }
        Ok((_, (lat, lng))) => Err(format!("coordinates out of range: {}, {}", lat, lng)),
        Err(_) => Err(format!("no coordinates in place: '{}'", place)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("lastknown").unwrap(), Command::LastKnown);
        assert_eq!(parse_command("LAST KNOWN").unwrap(), Command::LastKnown);
        assert_eq!(parse_command("metadata").unwrap(), Command::Metadata);
        assert_eq!(parse_command(" COMPACT ").unwrap(), Command::Compact);
        assert_eq!(parse_command("purge testing").unwrap(), Command::PurgeTesting);
        assert_eq!(parse_command("quit").unwrap(), Command::Exit);
        assert_eq!(
            parse_command("POPULATE 'tracks/today.json'").unwrap(),
            Command::Populate { path: "tracks/today.json".to_string() }
        );
    }

    #[test]
    fn test_parse_visits_full() {
        let cmd = parse_command(
            "VISITS WHERE IN BBOX (44, -94) (46.5, -92) NAMES 'rye', \"ia\" UUIDS 'abc' SINCE 1700000000 UNTIL 1700003600 PAGE 10..20 REVERSE",
        )
        .unwrap();
        let Command::Visits(f) = cmd else { panic!("expected visits") };
        assert_eq!(f.bbox_sw, Some(vec![44.0, -94.0]));
        assert_eq!(f.bbox_ne, Some(vec![46.5, -92.0]));
        assert_eq!(f.names, vec!["rye", "ia"]);
        assert_eq!(f.uuids, vec!["abc"]);
        assert_eq!(f.start_reported.map(|t| t.timestamp()), Some(1700000000));
        assert_eq!(f.end_reported.map(|t| t.timestamp()), Some(1700003600));
        assert_eq!((f.start_index, f.end_index), (10, 20));
        assert!(f.reverse_chrono);
    }

    #[test]
    fn test_parse_visits_bare() {
        assert_eq!(parse_command("visits").unwrap(), Command::Visits(VisitFilter::default()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("VISITS PAGE 1..").is_err());
        assert!(parse_command("DROP TABLE").is_err());
        assert!(parse_command("LASTKNOWN please").unwrap_err().starts_with("Unexpected tokens"));
    }

    #[test]
    fn test_syntax_error_context_on_multibyte_input() {
        for pad in 0..4 {
            let line = format!("{}{}", "x".repeat(pad), "ñandú".repeat(8));
            let err = parse_command(&line).unwrap_err();
            assert!(err.starts_with("Invalid syntax near"), "{err}");
            assert!(err.ends_with("...'"), "{err}");
        }
    }

    #[test]
    fn test_place_coordinates() {
        let place = "25 Yeadon Ave, Charleston, SC @ <+32.78044829,-79.98285770> +/- 100.00m, region CLCircularRegion";
        let (lat, lng) = parse_place_coordinates(place).unwrap();
        assert!((lat - 32.78044829).abs() < 1e-9);
        assert!((lng + 79.98285770).abs() < 1e-9);

        assert!(parse_place_coordinates("somewhere").is_err());
        assert!(parse_place_coordinates("<+132.0,-79.9>").is_err());
    }
}
