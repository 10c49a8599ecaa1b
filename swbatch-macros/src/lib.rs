use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Test attribute that installs tracing and runs the body inside a span named
/// after the test. Async bodies run on `#[tokio::test]`, and any arguments are
/// forwarded to it, so `#[swbatch::test(start_paused = true)]` gets a paused clock.
///
/// ```ignore
/// #[swbatch::test]
/// async fn submits_one_batch() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let tokio_args = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    let name = &sig.ident;

    let output = if sig.asyncness.is_some() {
        let tokio_attr = if tokio_args.is_empty() {
            quote! { #[tokio::test] }
        } else {
            quote! { #[tokio::test(#tokio_args)] }
        };
        quote! {
            #tokio_attr
            #(#attrs)*
            #vis #sig {
                swbatch::trace::with_test_tracing(stringify!(#name), || async move #block).await
            }
        }
    } else {
        quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                swbatch::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        }
    };
    output.into()
}
