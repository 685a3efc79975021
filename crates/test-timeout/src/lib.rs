use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Wraps an async test in a current-thread Tokio runtime and bounds it with
/// `tokio::time::timeout` so a wedged await fails the test instead of hanging
/// the whole suite. Optional argument overrides the timeout in seconds:
/// `#[test_timeout::tokio_timeout_test(5)]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs: u64 = 30;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) | Err(_) => {
                return syn::Error::new_spanned(lit, "timeout must be a positive integer of seconds")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => timeout_secs = secs,
        }
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    // Strip a stray #[tokio::test] so the expansion stays the only runtime.
    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                let budget = std::time::Duration::from_secs(#timeout_secs);
                if tokio::time::timeout(budget, async move #block).await.is_err() {
                    panic!("test exceeded its {}s budget", #timeout_secs);
                }
            });
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
