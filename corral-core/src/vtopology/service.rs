use std::collections::BTreeMap;

use anyhow::Result;

use super::{compute_virtual_topology_string, physical_fault_zone_key, virtual_fault_zone_key, AssignmentAlgorithmType, ZoneMapping};
use crate::commit::ConfigCommit;
use crate::error::AppError;
use crate::maintenance::Maintenance;
use crate::models::{ClusterConfig, ClusterTopologyConfig, InstanceConfig, MaintenanceTrigger};
use crate::paths::PathBuilder;
use crate::store::{self, DataUpdater, StoreRef};
use crate::topology::ClusterTopology;

pub const FIELD_GROUP_NAME: &str = "virtualTopologyGroupName";
pub const FIELD_GROUP_NUMBER: &str = "virtualTopologyGroupNumber";
pub const FIELD_ASSIGNMENT_ALGORITHM_TYPE: &str = "assignmentAlgorithmType";
pub const FIELD_FORCE_RECOMPUTE: &str = "forceRecompute";
pub const FIELD_AUTO_MAINTENANCE_MODE_DISABLED: &str = "autoMaintenanceModeDisabled";

/// A request to assign the nodes of a cluster into virtual topology groups.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualTopologyGroupRequest {
    /// The prefix of the group names.
    pub group_name: String,
    /// The number of groups to create.
    pub group_number: usize,
    pub assignment_algorithm_type: AssignmentAlgorithmType,
    /// Ignore any existing virtual groups.
    pub force_recompute: bool,
    /// Do not enter and exit maintenance mode around the mutation. The caller must hold it.
    pub auto_maintenance_mode_disabled: bool,
    /// Fields recorded on the maintenance signal.
    pub custom_fields: BTreeMap<String, String>,
}

impl VirtualTopologyGroupRequest {
    pub fn new(group_name: impl Into<String>, group_number: usize) -> Self {
        Self {
            group_name: group_name.into(),
            group_number,
            assignment_algorithm_type: AssignmentAlgorithmType::default(),
            force_recompute: false,
            auto_maintenance_mode_disabled: false,
            custom_fields: BTreeMap::new(),
        }
    }

    /// Parse a request from a map of string fields, as given by an admin API.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let group_name = fields.get(FIELD_GROUP_NAME).cloned().unwrap_or_default();
        let group_number = match fields.get(FIELD_GROUP_NUMBER).map(|val| val.trim()) {
            None | Some("") => 0,
            Some(val) => match val.parse::<i64>() {
                Ok(num) if num > 0 => num as usize,
                Ok(_) => return Err(AppError::InvalidArgument("number of virtual groups must be positive".into()).into()),
                Err(_) => return Err(AppError::InvalidArgument(format!("virtual group number {} is not an integer", val)).into()),
            },
        };
        let assignment_algorithm_type = match fields.get(FIELD_ASSIGNMENT_ALGORITHM_TYPE) {
            Some(val) => val.parse()?,
            None => AssignmentAlgorithmType::default(),
        };
        Ok(Self {
            group_name,
            group_number,
            assignment_algorithm_type,
            force_recompute: parse_flag(fields, FIELD_FORCE_RECOMPUTE)?,
            auto_maintenance_mode_disabled: parse_flag(fields, FIELD_AUTO_MAINTENANCE_MODE_DISABLED)?,
            custom_fields: fields.clone(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.group_name.trim().is_empty() {
            return Err(AppError::InvalidArgument("virtual group name cannot be empty".into()).into());
        }
        if self.group_number == 0 {
            return Err(AppError::InvalidArgument("number of virtual groups must be positive".into()).into());
        }
        Ok(())
    }
}

fn parse_flag(fields: &BTreeMap<String, String>, key: &str) -> Result<bool> {
    match fields.get(key).map(|val| val.trim().to_lowercase()) {
        None => Ok(false),
        Some(val) if val.is_empty() || val == "false" => Ok(false),
        Some(val) if val == "true" => Ok(true),
        Some(val) => Err(AppError::InvalidArgument(format!("{} must be true or false, got {}", key, val)).into()),
    }
}

/// Admin operations on the virtual topology of a cluster.
#[derive(Clone)]
pub struct VirtualTopologyGroupService {
    store: StoreRef,
    paths: PathBuilder,
    maintenance: Maintenance,
    commit: ConfigCommit,
}

impl VirtualTopologyGroupService {
    pub fn new(store: StoreRef, paths: PathBuilder) -> Self {
        Self {
            maintenance: Maintenance::new(store.clone(), paths.clone()),
            commit: ConfigCommit::new(store.clone(), paths.clone()),
            store,
            paths,
        }
    }

    /// Assign every node of the cluster into a virtual group, then rewrite the cluster's topology
    /// so that the virtual groups act as its fault zones.
    ///
    /// Input and precondition failures are reported before anything is mutated. Unless
    /// `auto_maintenance_mode_disabled` is set, the cluster enters maintenance mode for the
    /// duration of the mutation and exits only once the whole commit succeeded.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_virtual_topology_group(&self, request: &VirtualTopologyGroupRequest) -> Result<ZoneMapping> {
        let cluster = match store::read_model::<ClusterConfig>(self.store.as_ref(), &self.paths.cluster_config()).await? {
            Some((cluster, _)) => cluster,
            None => return Err(AppError::Precondition(format!("cluster {} has no cluster config", self.paths.cluster())).into()),
        };
        let instances = store::read_children_models::<InstanceConfig>(self.store.as_ref(), &self.paths.instance_configs()).await?;
        let physical = physical_zone_mapping(&cluster, &instances)?;
        let existing = if request.force_recompute {
            ZoneMapping::new()
        } else {
            virtual_zone_mapping(&cluster, &instances)
        };

        if !cluster.topology_aware_enabled {
            return Err(AppError::Precondition(format!("topology aware rebalance is not enabled in cluster {}", self.paths.cluster())).into());
        }
        request.validate()?;
        match request.assignment_algorithm_type {
            AssignmentAlgorithmType::ZoneBased if request.group_number > physical.len() => {
                return Err(AppError::InvalidArgument(format!(
                    "number of virtual groups {} cannot be greater than the number of zones {}",
                    request.group_number,
                    physical.len()
                ))
                .into())
            }
            AssignmentAlgorithmType::InstanceBased if request.group_number > instances.len() => {
                return Err(AppError::InvalidArgument(format!(
                    "number of virtual groups {} cannot be greater than the number of instances {}",
                    request.group_number,
                    instances.len()
                ))
                .into())
            }
            _ => (),
        }

        tracing::info!(cluster = self.paths.cluster(), ?request, "computing virtual topology groups");
        let assignment = request
            .assignment_algorithm_type
            .algorithm()
            .compute_assignment(request.group_number, &request.group_name, &physical, &existing);

        if !request.auto_maintenance_mode_disabled {
            if self.maintenance.is_in_maintenance().await? {
                return Err(AppError::Precondition(format!(
                    "cluster {} is already in maintenance mode, set auto maintenance mode disabled if this is intended",
                    self.paths.cluster()
                ))
                .into());
            }
            self.maintenance
                .enter("virtual topology group change", MaintenanceTrigger::User, request.custom_fields.clone())
                .await?;
        }
        self.maintenance.require_held().await?;

        self.update_configs(&cluster, &assignment).await?;
        if !request.auto_maintenance_mode_disabled {
            self.maintenance.exit().await?;
        }
        tracing::info!(cluster = self.paths.cluster(), groups = assignment.len(), "virtual topology groups applied");
        Ok(assignment)
    }

    async fn update_configs(&self, cluster: &ClusterConfig, assignment: &ZoneMapping) -> Result<()> {
        let virtual_key = virtual_fault_zone_key(cluster.fault_zone_type.as_deref());
        let mut updates: Vec<(String, DataUpdater)> = vec![];
        for (group, nodes) in assignment.iter() {
            for node in nodes {
                let (key, group) = (virtual_key.clone(), group.clone());
                let updater = store::model_updater(move |config: Option<InstanceConfig>| {
                    let mut config = match config {
                        Some(config) => config,
                        None => return Err(AppError::Precondition("instance config was removed".into()).into()),
                    };
                    let mut domain = config.domain_as_map();
                    domain.insert(key, group);
                    config.set_domain(&domain);
                    Ok(config)
                });
                updates.push((self.paths.instance_config(node), updater));
            }
        }

        let topology = compute_virtual_topology_string(cluster)?;
        self.commit
            .commit(updates, move |mut config| {
                config.topology = Some(topology);
                config.fault_zone_type = Some(virtual_key);
                Ok(config)
            })
            .await
    }
}

/// Physical zone to member nodes, by the physical form of the cluster's fault zone key.
fn physical_zone_mapping(cluster: &ClusterConfig, instances: &BTreeMap<String, InstanceConfig>) -> Result<ZoneMapping> {
    let mut config = ClusterTopologyConfig::from_cluster_config(cluster)?;
    config.fault_zone_type = physical_fault_zone_key(&config.fault_zone_type).unwrap_or_else(|| config.end_node_type.clone());
    Ok(ClusterTopology::new(config, instances.values()).zones().clone())
}

/// Virtual group to member nodes, from the virtual key already present in node domains.
fn virtual_zone_mapping(cluster: &ClusterConfig, instances: &BTreeMap<String, InstanceConfig>) -> ZoneMapping {
    let key = virtual_fault_zone_key(cluster.fault_zone_type.as_deref());
    let mut mapping = ZoneMapping::new();
    for instance in instances.values() {
        if let Some(group) = instance.domain_as_map().remove(&key) {
            mapping.entry(group).or_default().insert(instance.instance_name.clone());
        }
    }
    mapping
}
