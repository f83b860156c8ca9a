//! The canonical `Derive(...)` printer.
//!
//! Output bytes feed content-addressing, so iteration order, quoting and
//! escaping are all fixed: outputs by id, environment by key, input
//! derivations by path, sets sorted. Ids, paths, hashes and the platform
//! print without escape processing; builder, arguments and environment
//! values get C-style escapes.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use silo_core::store_path::StoreDir;

use super::{Derivation, DerivationOutput};

impl Derivation {
    /// Render the canonical textual form.
    ///
    /// With `mask_outputs`, output paths (and environment values named
    /// after an output) print as empty strings; `actual_inputs`, when
    /// given, replaces the input-derivation map wholesale.
    pub fn unparse(
        &self,
        store_dir: &StoreDir,
        mask_outputs: bool,
        actual_inputs: Option<&BTreeMap<String, BTreeSet<String>>>,
    ) -> Result<String> {
        let mut s = String::with_capacity(4096);
        s.push_str("Derive([");

        let mut first = true;
        for (id, output) in &self.outputs {
            sep(&mut s, &mut first);
            s.push('(');
            print_unquoted(&mut s, id);
            s.push(',');
            if mask_outputs {
                print_unquoted(&mut s, "");
            } else {
                let path = output.path(store_dir, &self.name)?;
                print_unquoted(&mut s, &store_dir.display_path(&path));
            }
            match output {
                DerivationOutput::Fixed { method, hash } => {
                    s.push(',');
                    print_unquoted(&mut s, &method.print_method_algo(hash.algo()));
                    s.push(',');
                    print_unquoted(&mut s, &hash.to_base16());
                }
                DerivationOutput::Intensional { .. } => {
                    s.push(',');
                    print_unquoted(&mut s, "");
                    s.push(',');
                    print_unquoted(&mut s, "");
                }
            }
            s.push(')');
        }

        s.push_str("],[");
        first = true;
        if let Some(actual_inputs) = actual_inputs {
            for (input, outputs) in actual_inputs {
                sep(&mut s, &mut first);
                s.push('(');
                print_unquoted(&mut s, input);
                s.push(',');
                print_unquoted_list(&mut s, outputs.iter());
                s.push(')');
            }
        } else {
            for (input, outputs) in &self.input_drvs {
                sep(&mut s, &mut first);
                s.push('(');
                print_unquoted(&mut s, &store_dir.display_path(input));
                s.push(',');
                print_unquoted_list(&mut s, outputs.iter());
                s.push(')');
            }
        }

        s.push_str("],");
        print_unquoted_list(
            &mut s,
            self.input_srcs
                .iter()
                .map(|p| store_dir.display_path(p))
                .collect::<Vec<_>>()
                .iter(),
        );

        s.push(',');
        print_unquoted(&mut s, &self.platform);
        s.push(',');
        print_escaped(&mut s, &self.builder);
        s.push(',');
        print_escaped_list(&mut s, self.args.iter());

        s.push_str(",[");
        first = true;
        for (name, value) in &self.env {
            sep(&mut s, &mut first);
            s.push('(');
            print_escaped(&mut s, name);
            s.push(',');
            if mask_outputs && self.outputs.contains_key(name) {
                print_escaped(&mut s, "");
            } else {
                print_escaped(&mut s, value);
            }
            s.push(')');
        }

        s.push_str("])");
        Ok(s)
    }
}

fn sep(s: &mut String, first: &mut bool) {
    if *first {
        *first = false;
    } else {
        s.push(',');
    }
}

fn print_escaped(s: &mut String, value: &str) {
    s.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                s.push('\\');
                s.push(c);
            }
            '\n' => s.push_str("\\n"),
            '\r' => s.push_str("\\r"),
            '\t' => s.push_str("\\t"),
            _ => s.push(c),
        }
    }
    s.push('"');
}

fn print_unquoted(s: &mut String, value: &str) {
    s.push('"');
    s.push_str(value);
    s.push('"');
}

fn print_escaped_list<S: AsRef<str>>(s: &mut String, items: impl Iterator<Item = S>) {
    s.push('[');
    let mut first = true;
    for item in items {
        sep(s, &mut first);
        print_escaped(s, item.as_ref());
    }
    s.push(']');
}

fn print_unquoted_list<S: AsRef<str>>(s: &mut String, items: impl Iterator<Item = S>) {
    s.push('[');
    let mut first = true;
    for item in items {
        sep(s, &mut first);
        print_unquoted(s, item.as_ref());
    }
    s.push(']');
}
