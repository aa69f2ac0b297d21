use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Attribute macro for tests that installs the crate's tracing subscriber first.
/// Works with both sync and async test functions; arguments are forwarded to
/// `#[tokio::test]`, so `#[osqueue::test(start_paused = true)]` gives paused time.
///
/// #[osqueue::test]
/// async fn engine_commits_batch() { ... }
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args_ts = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &input.sig.ident;

    let paren_args = if args_ts.is_empty() {
        quote! {}
    } else {
        quote! { ( #args_ts ) }
    };

    let output = if sig.asyncness.is_some() {
        quote! {
            #[tokio::test #paren_args]
            #(#attrs)*
            #vis #sig {
                osqueue::trace::with_test_tracing(stringify!(#name), || async move { #block }).await
            }
        }
    } else {
        quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                osqueue::trace::with_test_tracing_sync(stringify!(#name), || { #block })
            }
        }
    };
    output.into()
}
