use once_cell::sync::Lazy;
use regex::Regex;

/// Package manager and download progress lines that drown the interesting parts of the log
static NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\s*\d+K [. ]+ \d+%.*\ds$",
        r"^Get:\d+ https?://.* [kM]B.*",
        r"^Preparing to unpack \.\.\..*",
        r"^Selecting previously unselected package.*",
        r"^Setting up .* \.\.\..*",
        r"^Unpacking .* \.\.\..*",
    ]
    .iter()
    .filter_map(|re| Regex::new(re).ok())
    .collect()
});

pub fn remove_useless_lines_from_cloud_init_output(s: &str) -> String {
    s.lines()
        .filter(|line| !NOISE.iter().any(|re| re.is_match(line)))
        .collect::<Vec<_>>()
        .join("\n")
}
