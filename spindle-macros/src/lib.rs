//! Entry-point attributes for the Spindle fiber runtime.
//!
//! Both attributes rewrite the body of a plain `fn` so that it runs inside a
//! fiber on a freshly built `IoManager`, then stop the manager once the
//! body returns. A panic in the body is reported by panicking the caller.

mod utils;

use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

/// Runs `main` inside a fiber.
///
/// ```rust,ignore
/// #[spindle::main(worker_threads = 4, name = "server")]
/// fn main() {
///     let iom = spindle::IoManager::current().unwrap();
///     iom.sleep_ms(10).unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut builder = String::from("::spindle::Builder::new()");

    for (key, value) in utils::key_values(attr) {
        match key.as_str() {
            "worker_threads" => match value.parse::<usize>() {
                Ok(n) => builder.push_str(&format!(".worker_threads({n})")),
                Err(_) => return utils::compile_error("worker_threads expects an integer"),
            },
            "name" => builder.push_str(&format!(".name({value})")),
            other => {
                return utils::compile_error(&format!("unknown spindle::main argument `{other}`"));
            }
        }
    }

    wrap_body(item, &builder, None)
}

/// Runs a `#[test]` function inside a fiber.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut builder = String::from("::spindle::Builder::new()");

    for (key, value) in utils::key_values(attr) {
        match key.as_str() {
            "worker_threads" => match value.parse::<usize>() {
                Ok(n) => builder.push_str(&format!(".worker_threads({n})")),
                Err(_) => return utils::compile_error("worker_threads expects an integer"),
            },
            other => {
                return utils::compile_error(&format!("unknown spindle::test argument `{other}`"));
            }
        }
    }

    wrap_body(item, &builder, Some("#[test]"))
}

fn wrap_body(item: TokenStream, builder: &str, prefix: Option<&str>) -> TokenStream {
    let mut tokens: Vec<TokenTree> = item.into_iter().collect();

    let Some(pos) = tokens
        .iter()
        .rposition(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Brace))
    else {
        return utils::compile_error("expected a function body");
    };

    let block = match &tokens[pos] {
        TokenTree::Group(g) => g.stream().to_string(),
        _ => unreachable!(),
    };

    let new_block = format!(
        "{{
            let __iom = {builder}
                .build_io_manager()
                .unwrap_or_else(|err| panic!(\"failed to start the I/O manager: {{}}\", err));
            let __out = __iom.block_on(move || {{ {block} }});
            __iom.stop();
            match __out {{
                ::core::result::Result::Ok(value) => value,
                ::core::result::Result::Err(err) => panic!(\"{{}}\", err),
            }}
        }}"
    );

    let Ok(body) = new_block.parse::<TokenStream>() else {
        return utils::compile_error("failed to rewrite the function body");
    };
    tokens[pos] = TokenTree::Group(Group::new(Delimiter::Brace, body));

    let mut result: Vec<TokenTree> = match prefix {
        Some(attr) => attr.parse::<TokenStream>().unwrap_or_default().into_iter().collect(),
        None => Vec::new(),
    };
    result.extend(tokens);

    result.into_iter().collect()
}
