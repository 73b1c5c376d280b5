use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Ident, ItemFn, LitStr};

const USAGE: &str = "rxflow_macro::test only accepts: #[rxflow_macro::test], \
                     #[rxflow_macro::test(local)], #[rxflow_macro::test(shared)], or string \
                     equivalents";

/// Marks a test function and installs the rxflow test logger before the body
/// runs.
///
/// Sync functions expand to `#[test]`. Async functions expand to
/// `#[tokio::test]`; pass `local` for a current-thread runtime or `shared` for
/// a multi-threaded one.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
  let input = parse_macro_input!(item as ItemFn);
  let is_async = input.sig.asyncness.is_some();

  let raw_args = proc_macro2::TokenStream::from(attr);
  let tokio_args = if raw_args.is_empty() {
    proc_macro2::TokenStream::new()
  } else {
    if !is_async {
      return syn::Error::new(
        raw_args.span(),
        "rxflow_macro::test flavor args are only supported for async tests",
      )
      .to_compile_error()
      .into();
    }
    let flavor = if let Ok(ident) = syn::parse2::<Ident>(raw_args.clone()) {
      (ident.to_string(), ident.span())
    } else if let Ok(lit) = syn::parse2::<LitStr>(raw_args.clone()) {
      (lit.value(), lit.span())
    } else {
      return syn::Error::new(raw_args.span(), USAGE).to_compile_error().into();
    };
    match flavor.0.as_str() {
      "local" => quote!(flavor = "current_thread"),
      "shared" => quote!(flavor = "multi_thread", worker_threads = 2),
      _ => return syn::Error::new(flavor.1, USAGE).to_compile_error().into(),
    }
  };

  let native_attr = if is_async { quote!(#[tokio::test(#tokio_args)]) } else { quote!(#[test]) };

  let ItemFn { attrs, vis, sig, block } = input;
  let expanded = quote! {
    #native_attr
    #(#attrs)*
    #vis #sig {
      ::rxflow::testing::init_test_logging();
      #block
    }
  };

  expanded.into()
}
