use crate::debugger::Location;
use lru::LruCache;
use std::io::BufRead;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{fs, io};

const CACHED_FILES: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(n) => n,
    None => unreachable!(),
};

/// Source lines around debuggee locations.
pub struct FileView {
    cached_lines: Mutex<LruCache<PathBuf, Arc<[String]>>>,
}

impl Default for FileView {
    fn default() -> Self {
        Self {
            cached_lines: Mutex::new(LruCache::new(CACHED_FILES)),
        }
    }
}

impl FileView {
    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self, file_path: &Path) -> anyhow::Result<Arc<[String]>> {
        let mut cache = self.cached_lines.lock().unwrap();
        if let Some(lines) = cache.get(file_path) {
            return Ok(lines.clone());
        }

        let file = fs::File::open(file_path)?;
        let lines: Arc<[String]> = io::BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .collect::<Vec<_>>()
            .into();
        cache.put(file_path.to_path_buf(), lines.clone());
        Ok(lines)
    }

    /// Render `length` lines starting from zero based line `start`.
    fn render(&self, file_path: &Path, start: u64, length: u64) -> anyhow::Result<String> {
        let lines = self.lines(file_path)?;
        let result = lines
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(length as usize)
            .fold(String::default(), |acc, (idx, line)| {
                format!("{acc}{:>4} {line}\n", idx + 1)
            });
        Ok(result)
    }

    /// Render the line of `location` with `bounds` lines around it.
    pub fn render_source(&self, location: &Location, bounds: u64) -> anyhow::Result<String> {
        let (Some(file), Some(line)) = (&location.file, location.line) else {
            return Ok(String::default());
        };
        let line_pos = line.max(1) - 1;
        let start = line_pos.saturating_sub(bounds);
        self.render(file, start, line_pos - start + bounds + 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_render_source() {
        let path = std::env::temp_dir().join(format!("mdbg-file-view-{}.c", std::process::id()));
        {
            let mut file = fs::File::create(&path).unwrap();
            for i in 1..=5 {
                writeln!(file, "line {i}").unwrap();
            }
        }

        struct TestCase {
            line: u64,
            bounds: u64,
            expected: &'static str,
        }
        let cases = vec![
            TestCase {
                line: 3,
                bounds: 0,
                expected: "   3 line 3\n",
            },
            TestCase {
                line: 1,
                bounds: 1,
                expected: "   1 line 1\n   2 line 2\n",
            },
            TestCase {
                line: 2,
                bounds: 2,
                expected: "   1 line 1\n   2 line 2\n   3 line 3\n   4 line 4\n",
            },
            TestCase {
                line: 5,
                bounds: 1,
                expected: "   4 line 4\n   5 line 5\n",
            },
        ];

        let view = FileView::new();
        for tc in cases {
            let rendered = view
                .render_source(&Location::at_line(&path, tc.line), tc.bounds)
                .unwrap();
            assert_eq!(rendered, tc.expected, "line {} bounds {}", tc.line, tc.bounds);
        }

        assert_eq!(view.render_source(&Location::default(), 1).unwrap(), "");
        fs::remove_file(&path).unwrap();
    }
}
