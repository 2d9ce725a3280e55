//! Counter expansion for operator-supplied custom URLs.
//!
//! A counter is a variable like `$(n)$` substituted by the integers of an
//! inclusive range. Global counting shares one counter value across all
//! custom URLs per step; local counting expands each URL independently.

use crate::supervisor::{WorkerError, WorkerResult};

use super::config::CustomSection;

/// A validated counter definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub variable: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl Counter {
    fn values(&self) -> impl Iterator<Item = i64> + '_ {
        let (start, end, step) = (self.start, self.end, self.step);
        std::iter::successors(Some(start), move |&v| {
            if step == 0 {
                return None;
            }
            let next = v + step;
            if step > 0 {
                (next <= end).then_some(next)
            } else {
                (next >= end).then_some(next)
            }
        })
    }
}

/// Validate the counter arrays of a configuration.
///
/// A counter whose step cannot reach its end (wrong sign, or zero) would
/// expand forever and is rejected at configuration load.
pub fn validate_counters(custom: &CustomSection) -> WorkerResult<Vec<Counter>> {
    let n = custom.counters.len();
    if custom.counters_start.len() != n
        || custom.counters_end.len() != n
        || custom.counters_step.len() != n
    {
        return Err(WorkerError::Config(
            "counter variable, start, end, and step arrays differ in length".to_string(),
        ));
    }

    let mut counters = Vec::with_capacity(n);
    for i in 0..n {
        let counter = Counter {
            variable: custom.counters[i].clone(),
            start: custom.counters_start[i],
            end: custom.counters_end[i],
            step: custom.counters_step[i],
        };

        if counter.variable.is_empty() {
            return Err(WorkerError::Config(format!("counter #{i} has no variable")));
        }

        let reachable = match counter.step {
            0 => counter.start == counter.end,
            step if step > 0 => counter.start <= counter.end,
            _ => counter.start >= counter.end,
        };
        if !reachable {
            return Err(WorkerError::Config(format!(
                "counter '{}' never reaches its end ({}..{} step {})",
                counter.variable, counter.start, counter.end, counter.step
            )));
        }

        counters.push(counter);
    }
    Ok(counters)
}

/// Expand custom URLs with their counters.
///
/// With global counting, each counter value is applied to every URL in one
/// pass; with local counting, each URL containing the variable is expanded
/// on its own. URLs without any counter pass through unchanged.
pub fn expand_custom_urls(
    urls: &[String],
    counters: &[Counter],
    global: bool,
) -> Vec<String> {
    if counters.is_empty() {
        return urls.to_vec();
    }

    let mut expanded = urls.to_vec();
    for counter in counters {
        expanded = if global {
            expand_global(&expanded, counter)
        } else {
            expanded
                .iter()
                .flat_map(|url| expand_local(url, counter))
                .collect()
        };
    }

    expanded.dedup();
    expanded
}

fn expand_global(urls: &[String], counter: &Counter) -> Vec<String> {
    if !urls.iter().any(|url| url.contains(&counter.variable)) {
        return urls.to_vec();
    }
    let mut out = Vec::new();
    for value in counter.values() {
        for url in urls {
            out.push(url.replace(&counter.variable, &value.to_string()));
        }
    }
    out
}

fn expand_local(url: &str, counter: &Counter) -> Vec<String> {
    if !url.contains(&counter.variable) {
        return vec![url.to_string()];
    }
    counter
        .values()
        .map(|value| url.replace(&counter.variable, &value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(
        counters: &[&str],
        start: &[i64],
        end: &[i64],
        step: &[i64],
        global: bool,
    ) -> CustomSection {
        CustomSection {
            counters: counters.iter().map(|s| s.to_string()).collect(),
            counters_start: start.to_vec(),
            counters_end: end.to_vec(),
            counters_step: step.to_vec(),
            counters_global: global,
            recrawl: false,
            urls: Vec::new(),
        }
    }

    #[test]
    fn test_local_expansion() {
        let counters =
            validate_counters(&custom(&["$(n)$"], &[1], &[3], &[1], false)).unwrap();
        let urls = vec!["/page/$(n)$".to_string(), "/static".to_string()];
        let expanded = expand_custom_urls(&urls, &counters, false);
        assert_eq!(expanded, vec!["/page/1", "/page/2", "/page/3", "/static"]);
    }

    #[test]
    fn test_global_expansion_interleaves() {
        let counters =
            validate_counters(&custom(&["$(n)$"], &[1], &[2], &[1], true)).unwrap();
        let urls = vec!["/a/$(n)$".to_string(), "/b/$(n)$".to_string()];
        let expanded = expand_custom_urls(&urls, &counters, true);
        assert_eq!(expanded, vec!["/a/1", "/b/1", "/a/2", "/b/2"]);
    }

    #[test]
    fn test_descending_counter() {
        let counters =
            validate_counters(&custom(&["$(n)$"], &[3], &[1], &[-1], false)).unwrap();
        let expanded = expand_custom_urls(&["/p$(n)$".to_string()], &counters, false);
        assert_eq!(expanded, vec!["/p3", "/p2", "/p1"]);
    }

    #[test]
    fn test_infinite_counter_rejected() {
        // start > end with a positive step never terminates.
        assert!(validate_counters(&custom(&["$(n)$"], &[5], &[1], &[1], false)).is_err());
        // zero step with distinct bounds never terminates.
        assert!(validate_counters(&custom(&["$(n)$"], &[1], &[2], &[0], false)).is_err());
        // zero step with equal bounds is a single value.
        assert!(validate_counters(&custom(&["$(n)$"], &[2], &[2], &[0], false)).is_ok());
    }

    #[test]
    fn test_mismatched_arrays_rejected() {
        assert!(validate_counters(&custom(&["$(n)$"], &[1], &[3], &[], false)).is_err());
    }

    #[test]
    fn test_multiple_counters_compose() {
        let counters =
            validate_counters(&custom(&["$(a)$", "$(b)$"], &[1, 1], &[2, 2], &[1, 1], false))
                .unwrap();
        let expanded = expand_custom_urls(&["/x/$(a)$/$(b)$".to_string()], &counters, false);
        assert_eq!(expanded, vec!["/x/1/1", "/x/1/2", "/x/2/1", "/x/2/2"]);
    }
}
