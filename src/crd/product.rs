use crate::store::ResourceDescriptor;

pub const API_GROUP: &str = "vjailbreak.k8s.pf9.io";
pub const API_VERSION: &str = "v1alpha1";

/// Agent node that represents the appliance itself; never counted or deleted
pub const MASTER_NODE_NAME: &str = "vjailbreak-master";

pub fn migration_plans() -> ResourceDescriptor {
    ResourceDescriptor::new(API_GROUP, API_VERSION, "MigrationPlan", "migrationplans", true)
}

pub fn rolling_migration_plans() -> ResourceDescriptor {
    ResourceDescriptor::new(
        API_GROUP,
        API_VERSION,
        "RollingMigrationPlan",
        "rollingmigrationplans",
        true,
    )
}

pub fn vjailbreak_nodes() -> ResourceDescriptor {
    ResourceDescriptor::new(API_GROUP, API_VERSION, "VjailbreakNode", "vjailbreaknodes", true)
}

pub fn is_master_sentinel(name: &str) -> bool {
    name == MASTER_NODE_NAME
}
