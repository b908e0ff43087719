pub mod config;
pub mod error;
pub mod events;
pub mod locks;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tronque un texte destiné à l'opérateur sans couper un caractère UTF-8
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("connection refused", 10), "connection");
        assert_eq!(truncate_chars("éàü", 2), "éà");
        assert_eq!(truncate_chars("ok", 50), "ok");
    }
}
