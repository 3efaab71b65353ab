//! Helper macros for `privpaste`

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Fields, Ident, ItemEnum};

/// Derive the process table of a privilege-separated program.
///
/// Every variant is one process; exactly one variant must carry the
/// `#[parent]` attribute and names the privileged supervisor.  The
/// remaining variants are the children that the supervisor spawns, in
/// declaration order.
#[proc_macro_derive(Privsep, attributes(parent))]
pub fn derive_privsep(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(item as ItemEnum);

    derive_privsep_enum(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn derive_privsep_enum(item: ItemEnum) -> Result<TokenStream, syn::Error> {
    let ident = item.ident.clone();
    let mut children = vec![];
    let mut parent: Option<Ident> = None;
    let mut as_ref_str = vec![];
    let mut from_str = vec![];

    for variant in item.variants.iter() {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new(
                variant.span(),
                "privsep processes must be unit variants",
            ));
        }

        let variant_ident = &variant.ident;
        let name = variant_ident.to_string().to_case(Case::Kebab);

        if variant.attrs.iter().any(|attr| attr.path.is_ident("parent")) {
            if parent.is_some() {
                return Err(syn::Error::new(
                    variant.span(),
                    "only one process can be the #[parent]",
                ));
            }
            parent = Some(variant_ident.clone());
        } else {
            children.push(quote! { Self::#variant_ident, });
        }

        as_ref_str.push(quote! {
            Self::#variant_ident => #name,
        });

        from_str.push(quote! {
            #name => Ok(Self::#variant_ident),
        });
    }

    let parent = parent
        .ok_or_else(|| syn::Error::new(item.span(), "missing #[parent] process"))?;
    let children_len = children.len();

    Ok(quote! {
        impl #ident {
            /// The processes that are spawned by the parent.
            pub const CHILDREN: [Self; #children_len] = [#(#children)*];

            /// The privileged parent process.
            pub const PARENT: Self = Self::#parent;

            /// Return the process name.
            pub const fn name(&self) -> &'static str {
                match self {
                    #(#as_ref_str)*
                }
            }
        }

        impl std::fmt::Display for #ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl std::str::FromStr for #ident {
            type Err = &'static str;

            fn from_str(name: &str) -> Result<Self, Self::Err> {
                match name {
                    #(#from_str)*
                    _ => Err("Invalid privsep process name"),
                }
            }
        }
    })
}
