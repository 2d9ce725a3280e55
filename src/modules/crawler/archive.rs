//! Memento timemap parsing for archive replay.
//!
//! Archives answering the Memento protocol return a timemap in RFC 7089
//! link format: one `<uri>; key="value"; ...` entry per line, separated by
//! commas. Entries with `rel` containing "memento" name an archived copy
//! and carry its timestamp in the `datetime` parameter.

use chrono::{DateTime, SecondsFormat, Utc};

/// An archived copy of a URL at a specific time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memento {
    pub url: String,
    /// Archive timestamp in the store's canonical format.
    pub timestamp: String,
}

/// Parse a timemap. Malformed entries are reported as warnings, not
/// errors; archives routinely serve slightly broken link format.
pub fn parse_mementos(timemap: &str) -> (Vec<Memento>, Vec<String>) {
    let mut mementos = Vec::new();
    let mut warnings = Vec::new();

    for raw_entry in split_entries(timemap) {
        let entry = raw_entry.trim();
        if entry.is_empty() {
            continue;
        }

        let Some(rest) = entry.strip_prefix('<') else {
            warnings.push(format!("entry without URI ignored: '{entry}'"));
            continue;
        };
        let Some((uri, params)) = rest.split_once('>') else {
            warnings.push(format!("unterminated URI ignored: '{entry}'"));
            continue;
        };

        let mut rel = None;
        let mut datetime = None;
        for param in params.split(';') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "rel" => rel = Some(value.to_string()),
                "datetime" => datetime = Some(value.to_string()),
                _ => {}
            }
        }

        let Some(rel) = rel else {
            continue;
        };
        if !rel.split_whitespace().any(|r| r.contains("memento")) {
            continue;
        }

        let Some(datetime) = datetime else {
            warnings.push(format!("memento without datetime ignored: '{uri}'"));
            continue;
        };

        match DateTime::parse_from_rfc2822(&datetime) {
            Ok(parsed) => mementos.push(Memento {
                url: uri.trim().to_string(),
                timestamp: parsed
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            }),
            Err(_) => {
                warnings.push(format!("unparseable datetime '{datetime}' for '{uri}'"));
            }
        }
    }

    (mementos, warnings)
}

/// Split a timemap into entries at commas that sit between them, not at
/// commas inside quoted parameter values (RFC 2822 dates contain one).
fn split_entries(timemap: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in timemap.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                entries.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        entries.push(current);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEMAP: &str = r#"<http://example.com/a>; rel="original",
<http://web.archive.org/web/timemap/link/http://example.com/a>; rel="self"; type="application/link-format",
<http://web.archive.org/web/20150601120000/http://example.com/a>; rel="first memento"; datetime="Mon, 01 Jun 2015 12:00:00 GMT",
<http://web.archive.org/web/20200315080000/http://example.com/a>; rel="memento"; datetime="Sun, 15 Mar 2020 08:00:00 GMT"
"#;

    #[test]
    fn test_parses_memento_entries_only() {
        let (mementos, warnings) = parse_mementos(TIMEMAP);
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(mementos.len(), 2);
        assert_eq!(
            mementos[0].url,
            "http://web.archive.org/web/20150601120000/http://example.com/a"
        );
        assert_eq!(mementos[0].timestamp, "2015-06-01T12:00:00.000000Z");
        assert_eq!(mementos[1].timestamp, "2020-03-15T08:00:00.000000Z");
    }

    #[test]
    fn test_commas_inside_datetimes_do_not_split() {
        // The RFC 2822 datetime itself contains a comma after the weekday.
        let (mementos, _) = parse_mementos(
            r#"<http://a.test/m>; rel="memento"; datetime="Tue, 02 Jan 2018 03:04:05 GMT""#,
        );
        assert_eq!(mementos.len(), 1);
    }

    #[test]
    fn test_malformed_entries_warn() {
        let timemap = r#"no-uri-here; rel="memento",
<http://a.test/m>; rel="memento",
<http://a.test/n>; rel="memento"; datetime="not a date""#;
        let (mementos, warnings) = parse_mementos(timemap);
        assert!(mementos.is_empty());
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn test_empty_timemap() {
        let (mementos, warnings) = parse_mementos("");
        assert!(mementos.is_empty());
        assert!(warnings.is_empty());
    }
}
