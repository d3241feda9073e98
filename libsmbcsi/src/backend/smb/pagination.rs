//! Token pagination shared by `ListVolumes` and `ListSnapshots`.
//!
//! Tokens are 1-based decimal start indices into the sorted collection.

use crate::error::CsiError;

/// Cut one page out of `items`.  Returns the page and the next token, which
/// is empty on the last page.
///
/// `max_entries == 0` returns everything from the start index on.
pub fn paginate<T>(
    items: Vec<T>,
    max_entries: i32,
    starting_token: &str,
) -> Result<(Vec<T>, String), CsiError> {
    if max_entries < 0 {
        return Err(CsiError::InvalidArgument(format!(
            "max_entries must not be negative, got {max_entries}"
        )));
    }
    let token = match starting_token.trim() {
        "" => "1",
        t => t,
    };
    let start: i64 = token.parse().map_err(|_| {
        CsiError::InvalidArgument(format!("starting token {token:?} is not a number"))
    })?;

    let n = items.len() as i64;
    if start > n {
        return Ok((Vec::new(), String::new()));
    }
    let start = start.max(1);
    let max = if max_entries == 0 { n } else { i64::from(max_entries) };

    let end = (start - 1 + max).min(n);
    let page = items
        .into_iter()
        .skip((start - 1) as usize)
        .take((end - (start - 1)) as usize)
        .collect();
    let next_token = if start + max <= n {
        (start + max).to_string()
    } else {
        String::new()
    };
    Ok((page, next_token))
}
