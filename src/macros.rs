#[macro_export]
macro_rules! regex {
    ($pat:expr) => {{
        static RE: once_cell::sync::Lazy<regex::Regex> =
            once_cell::sync::Lazy::new(|| regex::Regex::new($pat).unwrap());
        &*RE
    }};
}

/// Intern a whitespace-separated list of tag texts into a pool.
///
/// Shorthand for grammar construction and tests:
/// `tag_list!(pool, "N", "Sg", "@SUBJ")`.
#[macro_export]
macro_rules! tag_list {
    ($pool:expr, $($tag:expr),* $(,)?) => {
        vec![ $( $pool.intern($tag).expect("tag parses") ),* ]
    };
}
