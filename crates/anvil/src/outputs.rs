//! Output store: read-only address lookup over one provisioning result.

use anvil_common::{Address, AnvilError, BoundTopology, Node, NodeRole, ProvisioningOutput, Topology};

/// Provisioning outputs paired with the topology that declared them
pub struct OutputStore<'a> {
    outputs: ProvisioningOutput,
    topology: &'a Topology,
}

impl<'a> OutputStore<'a> {
    pub fn new(outputs: ProvisioningOutput, topology: &'a Topology) -> Self {
        Self { outputs, topology }
    }

    /// Address of the `index`-th node with `role`.
    ///
    /// Only declared nodes resolve; extra outputs never widen the topology.
    pub fn resolve(&self, role: NodeRole, index: usize) -> Result<Address, AnvilError> {
        let spec = self.topology.get(role, index).ok_or_else(|| AnvilError::NotFound {
            role,
            index,
            reason: "not declared in topology".to_string(),
        })?;

        let key = spec.output_key();
        let raw = self.outputs.get(&key).ok_or_else(|| AnvilError::NotFound {
            role,
            index,
            reason: format!("output `{}` for node `{}` is missing", key, spec.id),
        })?;

        Address::parse(raw).ok_or_else(|| AnvilError::NotFound {
            role,
            index,
            reason: format!("output `{}` for node `{}` is not an address: {:?}", key, spec.id, raw),
        })
    }

    /// Resolve every declared node, failing on the first unresolved one
    pub fn bind(&self) -> Result<BoundTopology, AnvilError> {
        let coordinator_spec = self.topology.coordinator();
        let coordinator = Node {
            id: coordinator_spec.id.clone(),
            role: NodeRole::Coordinator,
            address: self.resolve(NodeRole::Coordinator, 0)?,
        };

        let workers = self
            .topology
            .workers()
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                Ok(Node {
                    id: spec.id.clone(),
                    role: NodeRole::Worker,
                    address: self.resolve(NodeRole::Worker, index)?,
                })
            })
            .collect::<Result<Vec<_>, AnvilError>>()?;

        for node in std::iter::once(&coordinator).chain(workers.iter()) {
            tracing::debug!(node = %node.id, role = %node.role, address = %node.address, "Resolved node");
        }

        Ok(BoundTopology { coordinator, workers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_common::NodeSpec;

    fn topology() -> Topology {
        Topology::new(vec![
            NodeSpec::new("m1", NodeRole::Coordinator),
            NodeSpec::new("w1", NodeRole::Worker),
            NodeSpec::new("w2", NodeRole::Worker),
        ])
        .unwrap()
    }

    fn outputs(pairs: &[(&str, &str)]) -> ProvisioningOutput {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_resolve_declared_nodes() {
        let topology = topology();
        let store = OutputStore::new(
            outputs(&[
                ("m1_public_ip", "10.0.0.1"),
                ("w1_public_ip", "10.0.0.2"),
                ("w2_public_ip", "10.0.0.3"),
            ]),
            &topology,
        );

        assert_eq!(store.resolve(NodeRole::Coordinator, 0).unwrap().as_str(), "10.0.0.1");
        assert_eq!(store.resolve(NodeRole::Worker, 1).unwrap().as_str(), "10.0.0.3");

        let bound = store.bind().unwrap();
        assert_eq!(bound.coordinator.id, "m1");
        assert_eq!(bound.workers[0].address.as_str(), "10.0.0.2");
    }

    #[test]
    fn test_out_of_topology_index_is_not_found_even_with_output() {
        let topology = topology();
        // An output exists for a third worker, but only two are declared
        let store = OutputStore::new(
            outputs(&[
                ("m1_public_ip", "10.0.0.1"),
                ("w1_public_ip", "10.0.0.2"),
                ("w2_public_ip", "10.0.0.3"),
                ("w3_public_ip", "10.0.0.4"),
            ]),
            &topology,
        );

        assert!(matches!(
            store.resolve(NodeRole::Worker, 2),
            Err(AnvilError::NotFound { index: 2, .. })
        ));
        assert!(matches!(
            store.resolve(NodeRole::Coordinator, 1),
            Err(AnvilError::NotFound { .. })
        ));
    }

    #[test]
    fn test_bind_fails_fast_on_missing_or_blank_address() {
        let topology = topology();
        let missing = OutputStore::new(
            outputs(&[("m1_public_ip", "10.0.0.1"), ("w1_public_ip", "10.0.0.2")]),
            &topology,
        );
        assert!(matches!(missing.bind(), Err(AnvilError::NotFound { index: 1, .. })));

        let blank = OutputStore::new(
            outputs(&[
                ("m1_public_ip", ""),
                ("w1_public_ip", "10.0.0.2"),
                ("w2_public_ip", "10.0.0.3"),
            ]),
            &topology,
        );
        assert!(matches!(
            blank.bind(),
            Err(AnvilError::NotFound { role: NodeRole::Coordinator, .. })
        ));
    }
}
