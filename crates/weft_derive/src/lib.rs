use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod ops;

/// Implements `Operation` by forwarding to the field marked `#[operation]`
/// (or the single field of a tuple struct).
#[proc_macro_derive(Operation, attributes(operation))]
pub fn derive_operation(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = ops::derive_operation(input);
    expanded.into()
}
