use proc_macro::{TokenStream, TokenTree};

/// Splits a `TokenStream` into comma-separated arguments.
///
/// Each argument is returned as a `Vec<TokenTree>`.
/// Commas at the top level are used as separators; commas inside groups
/// belong to their group token and are left alone.
pub(crate) fn split_args(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = Vec::new();
    let mut current = Vec::new();

    for token in input {
        match &token {
            TokenTree::Punct(p) if p.as_char() == ',' => {
                if !current.is_empty() {
                    args.push(current);
                    current = Vec::new();
                }
            }
            _ => current.push(token),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Parses `key = value` attribute arguments.
///
/// Arguments without a `=` are returned with an empty value.
pub(crate) fn key_values(input: TokenStream) -> Vec<(String, String)> {
    split_args(input)
        .into_iter()
        .filter_map(|arg| {
            let (key, rest) = arg.split_first()?;
            let value = match rest.split_first() {
                Some((TokenTree::Punct(p), value)) if p.as_char() == '=' => {
                    tokens_to_string(value)
                }
                _ => String::new(),
            };

            Some((key.to_string(), value))
        })
        .collect()
}

/// Converts a slice of tokens into a Rust source string.
///
/// Inserts spaces between consecutive identifiers to avoid accidental
/// token merging (e.g. `foo bar` vs `foobar`).
pub(crate) fn tokens_to_string(tokens: &[TokenTree]) -> String {
    let mut out = String::new();
    let mut prev_was_ident = false;

    for t in tokens {
        let needs_space = prev_was_ident && matches!(t, TokenTree::Ident(_));

        if needs_space {
            out.push(' ');
        }

        out.push_str(&t.to_string());
        prev_was_ident = matches!(t, TokenTree::Ident(_));
    }

    out
}

/// Builds a `compile_error!` invocation carrying `message`.
pub(crate) fn compile_error(message: &str) -> TokenStream {
    format!("compile_error!({message:?});")
        .parse()
        .unwrap_or_default()
}
