//! `#[tokio_timeout_test]` for the peerlink test suites.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]            // 30s limit
//! #[test_timeout::tokio_timeout_test(10)]        // 10s limit
//! #[test_timeout::tokio_timeout_test(10, trace)] // plus tracing to the test writer
//! async fn relay_round_trip() { ... }
//! ```
//!
//! The body runs on its own thread with a two-worker runtime so that a test
//! wedged in a non-yielding loop still fails instead of hanging the harness.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

enum Setting {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for Setting {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(Setting::Secs)
        } else {
            input.parse().map(Setting::Flag)
        }
    }
}

struct Options {
    timeout_secs: u64,
    trace: bool,
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = Options {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            trace: false,
        };
        for setting in Punctuated::<Setting, Token![,]>::parse_terminated(input)? {
            match setting {
                Setting::Secs(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be non-zero"));
                    }
                    options.timeout_secs = secs;
                }
                Setting::Flag(ident) if ident == "trace" => options.trace = true,
                Setting::Flag(ident) => {
                    return Err(syn::Error::new_spanned(
                        ident,
                        "expected a timeout in seconds or `trace`",
                    ));
                }
            }
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let timeout_secs = options.timeout_secs;
    let name = sig.ident.to_string();
    let trace_init: TokenStream2 = if options.trace {
        quote! {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peerlink=debug")),
                )
                .with_test_writer()
                .try_init();
        }
    } else {
        TokenStream2::new()
    };

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #trace_init
            let limit = std::time::Duration::from_secs(#timeout_secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let worker = std::thread::Builder::new()
                .name(format!("{}-body", #name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_multi_thread()
                            .worker_threads(2)
                            .enable_all()
                            .build()
                            .expect("build test runtime");
                        runtime.block_on(async move {
                            if tokio::time::timeout(limit, async move #block).await.is_err() {
                                panic!("{} exceeded {:?}", #name, limit);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");
            match done_rx.recv_timeout(limit + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(_) => panic!("{} did not finish within {:?}", #name, limit),
            }
        }
    }
    .into()
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
