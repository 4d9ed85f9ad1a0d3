use std::path::Path;

use crate::error::{FleetError, Result};

/// Split `items` into contiguous chunks of `size`; the last may be shorter.
///
/// `size <= 0` means no splitting: one chunk holding every item, even when
/// there are none.
pub fn chunk_inputs(items: &[String], size: i64) -> Vec<Vec<String>> {
    if size <= 0 {
        return vec![items.to_vec()];
    }
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    items.chunks(size).map(<[String]>::to_vec).collect()
}

/// Read newline-delimited input files in order. Lines are trimmed and blank
/// lines dropped.
pub async fn load_input_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Config(format!("cannot read input {}: {}", path.display(), e))
        })?;
        items.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn splits_with_short_tail() {
        let chunks = chunk_inputs(&items(&["a", "b", "c", "d", "e"]), 2);
        assert_eq!(
            chunks,
            vec![items(&["a", "b"]), items(&["c", "d"]), items(&["e"])]
        );
    }

    #[test]
    fn non_positive_size_means_single_chunk() {
        let input = items(&["a", "b", "c"]);
        assert_eq!(chunk_inputs(&input, 0), vec![input.clone()]);
        assert_eq!(chunk_inputs(&input, -4), vec![input]);
        assert_eq!(chunk_inputs(&[], 0), vec![Vec::<String>::new()]);
    }

    #[test]
    fn empty_input_with_positive_size_has_no_chunks() {
        assert!(chunk_inputs(&[], 3).is_empty());
    }

    #[test]
    fn concatenation_reproduces_input() {
        let input: Vec<String> = (0..23).map(|i| format!("item-{}", i)).collect();
        for size in 0..30 {
            let chunks = chunk_inputs(&input, size);
            let expected_count = if size <= 0 {
                1
            } else {
                input.len().div_ceil(size as usize)
            };
            assert_eq!(chunks.len(), expected_count, "size {}", size);
            assert_eq!(chunks.concat(), input, "size {}", size);
        }
    }

    #[tokio::test]
    async fn loads_and_cleans_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        tokio::fs::write(&a, "  one \n\ntwo\n").await.unwrap();
        tokio::fs::write(&b, "three\n   \n").await.unwrap();

        let loaded = load_input_files(&[a, b]).await.unwrap();
        assert_eq!(loaded, items(&["one", "two", "three"]));

        let missing = load_input_files(&["/nonexistent/inputs.txt"]).await;
        assert!(matches!(missing, Err(FleetError::Config(_))));
    }
}
