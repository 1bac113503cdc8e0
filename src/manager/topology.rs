//! The manager's view of the model topology.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{Conduit, Model};
use crate::reference::Reference;

/// The conduits of the model and the multiplicity of each kernel,
/// indexed for peer resolution.
pub struct TopologyStore {
    conduits: Vec<Conduit>,
    kernel_dimensions: HashMap<Reference, Vec<usize>>,
}

impl TopologyStore {
    pub fn new(model: &Model) -> Result<TopologyStore> {
        let mut kernel_dimensions = HashMap::new();
        for (name, declaration) in &model.compute_elements {
            kernel_dimensions.insert(name.clone(), declaration.multiplicity.clone());
        }

        for conduit in &model.conduits {
            for kernel in [conduit.sending_component()?, conduit.receiving_component()?] {
                if !kernel_dimensions.contains_key(&kernel) {
                    return Err(Error::Config(format!(
                        "conduit {} -> {} references undeclared element '{}'",
                        conduit.sender, conduit.receiver, kernel
                    )));
                }
            }
        }

        Ok(TopologyStore { conduits: model.conduits.clone(), kernel_dimensions })
    }

    pub fn has_kernel(&self, kernel: &Reference) -> bool {
        self.kernel_dimensions.contains_key(kernel)
    }

    pub fn kernel_dimensions(&self, kernel: &Reference) -> Option<&Vec<usize>> {
        self.kernel_dimensions.get(kernel)
    }

    /// All conduits with an endpoint on the given kernel, in declaration
    /// order.
    pub fn conduits_for(&self, kernel: &Reference) -> Vec<Conduit> {
        self.conduits
            .iter()
            .filter(|conduit| {
                conduit.sending_component().map(|k| &k == kernel).unwrap_or(false)
                    || conduit
                        .receiving_component()
                        .map(|k| &k == kernel)
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ComputeElementDecl;
    use std::collections::BTreeMap;

    fn reference(text: &str) -> Reference {
        Reference::new(text).unwrap()
    }

    fn macro_micro_model() -> Model {
        let mut compute_elements = BTreeMap::new();
        compute_elements.insert(
            reference("macro"),
            ComputeElementDecl {
                implementation: "macro_implementation".to_string(),
                multiplicity: vec![],
            },
        );
        compute_elements.insert(
            reference("micro"),
            ComputeElementDecl {
                implementation: "micro_implementation".to_string(),
                multiplicity: vec![10, 10],
            },
        );
        Model {
            name: reference("test_model"),
            compute_elements,
            conduits: vec![
                Conduit::new("macro.out", "micro.in").unwrap(),
                Conduit::new("micro.out", "macro.in").unwrap(),
            ],
        }
    }

    #[test]
    fn stores_dimensions_and_conduits() {
        let store = TopologyStore::new(&macro_micro_model()).unwrap();
        assert!(store.has_kernel(&reference("macro")));
        assert!(!store.has_kernel(&reference("does_not_exist")));
        assert_eq!(
            store.kernel_dimensions(&reference("micro")),
            Some(&vec![10, 10])
        );

        let conduits = store.conduits_for(&reference("macro"));
        assert_eq!(conduits.len(), 2);
        assert_eq!(conduits[0].sender.to_string(), "macro.out");
        assert_eq!(conduits[1].sender.to_string(), "micro.out");
    }

    #[test]
    fn rejects_conduits_to_undeclared_elements() {
        let mut model = macro_micro_model();
        model
            .conduits
            .push(Conduit::new("macro.other", "meso.in").unwrap());
        assert!(matches!(TopologyStore::new(&model), Err(Error::Config(_))));
    }
}
