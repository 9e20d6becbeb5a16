//! SQL identifier quoting for rendered statement text.

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use persistctx_core::quote_ident;
///
/// assert_eq!(quote_ident("person"), "\"person\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly table-qualified column (`alias.column`).
///
/// Each dot-separated part is quoted on its own.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("person"), "\"person\"");
    }

    #[test]
    fn test_quote_ident_embedded_double_quote() {
        assert_eq!(quote_ident("a\"b\"c"), "\"a\"\"b\"\"c\"");
    }

    #[test]
    fn test_quote_ident_keyword() {
        assert_eq!(quote_ident("order"), "\"order\"");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("team.name"), "\"team\".\"name\"");
        assert_eq!(quote_qualified("name"), "\"name\"");
    }
}
