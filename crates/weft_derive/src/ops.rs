use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Fields, LitStr, Path, Token, WherePredicate,
    punctuated::Punctuated, spanned::Spanned,
};

type Bounds = Punctuated<WherePredicate, Token![,]>;

/// Options of the container-level `#[operation(...)]` attribute.
#[derive(Default)]
struct Options {
    /// Path of the crate defining `Operation`, `::weft` if absent.
    krate: Option<Path>,
    bounds: Bounds,
}

pub fn derive_operation(input: DeriveInput) -> TokenStream {
    expand(input).unwrap_or_else(syn::Error::into_compile_error)
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let Data::Struct(data) = &input.data else {
        let msg = "`Operation` can only be derived for structs";
        return Err(syn::Error::new(input.span(), msg));
    };
    // determine the field access expression for trait forwarding
    let field = forward_field(&data.fields, &input)?;
    // parse operation attributes
    let Options { krate, bounds } = options(&input.attrs)?;

    // determine the base path for trait implementation
    let ops = match krate {
        Some(path) => quote!(#path::hal::ops),
        None => quote!(::weft::hal::ops),
    };

    // user bounds join the struct's own where clause
    let name = &input.ident;
    let (impl_generics, ty_generics, _) = input.generics.split_for_impl();
    let mut generics = input.generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(bounds);

    Ok(quote! {
        impl #impl_generics #ops::Operation for #name #ty_generics #where_clause {
            fn kind(&self) -> #ops::OpKind {
                #ops::Operation::kind(&#field)
            }

            fn weights(&self) -> &[#ops::WeightBlob] {
                #ops::Operation::weights(&#field)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }
    })
}

/// Access expression of the field every accessor forwards to.
fn forward_field(fields: &Fields, input: &DeriveInput) -> syn::Result<TokenStream> {
    match fields {
        // newtype over the base
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => Ok(quote!(self.0)),
        Fields::Unnamed(fields) => Err(syn::Error::new(
            fields.span(),
            "tuple structs must have exactly one field",
        )),
        // named struct: require exactly one #[operation] field
        Fields::Named(fields) => {
            let mut marked = fields
                .named
                .iter()
                .filter(|field| field.attrs.iter().any(|x| x.path().is_ident("operation")));
            match (marked.next(), marked.next()) {
                (Some(field), None) => {
                    let ident = &field.ident;
                    Ok(quote!(self.#ident))
                }
                (None, _) => Err(syn::Error::new(
                    fields.span(),
                    "no field marked with #[operation] attribute",
                )),
                (Some(_), Some(extra)) => Err(syn::Error::new(
                    extra.span(),
                    "multiple fields marked with #[operation] attribute",
                )),
            }
        }
        Fields::Unit => Err(syn::Error::new(
            input.span(),
            "unit structs are not supported by `Operation` derive",
        )),
    }
}

/// Collects `crate = "..."` and `bound = "..."` from every container attribute.
fn options(attrs: &[Attribute]) -> syn::Result<Options> {
    let mut options = Options::default();
    for attr in attrs.iter().filter(|x| x.path().is_ident("operation")) {
        attr.parse_nested_meta(|meta| {
            let value: LitStr = match &meta.path {
                path if path.is_ident("crate") || path.is_ident("bound") => meta.value()?.parse()?,
                _ => {
                    let msg = "unexpected attribute; supported are `crate` and `bound`";
                    return Err(meta.error(msg));
                }
            };
            if meta.path.is_ident("crate") {
                options.krate = Some(value.parse()?);
            } else {
                options.bounds.extend(value.parse_with(Bounds::parse_terminated)?);
            }
            Ok(())
        })?;
    }
    Ok(options)
}
