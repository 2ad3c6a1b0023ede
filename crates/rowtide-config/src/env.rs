/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables resolve to "".
pub fn resolve_env(s: &str) -> String {
    let mut result = s.to_string();
    let mut search_from = 0;

    while let Some(rel) = result[search_from..].find("${") {
        let start = search_from + rel;
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
        search_from = start + value.len();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_resolve_env() {
        std::env::set_var("ROWTIDE_TEST_VAR", "hello");

        assert_eq!(resolve_env("${ROWTIDE_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env("prefix_${ROWTIDE_TEST_VAR}_suffix"),
            "prefix_hello_suffix"
        );
        assert_eq!(resolve_env("no_vars"), "no_vars");
        assert_eq!(resolve_env("${ROWTIDE_TEST_UNSET_VAR}x"), "x");
        assert_eq!(resolve_env("broken ${OPEN"), "broken ${OPEN");
    }

    #[test]
    #[serial]
    fn test_resolved_value_is_not_expanded_again() {
        std::env::set_var("ROWTIDE_TEST_NESTED", "${ROWTIDE_TEST_NESTED}");
        assert_eq!(resolve_env("${ROWTIDE_TEST_NESTED}"), "${ROWTIDE_TEST_NESTED}");
    }
}
