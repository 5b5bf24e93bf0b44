//! Resource kinds and their comparison rules.

use serde::{Deserialize, Serialize};

/// The kind of infrastructure unit a resource declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network.
    Vpc,
    /// Subnet inside a network.
    Subnet,
    /// Security group.
    SecurityGroup,
    /// Single ingress/egress rule attached to a security group.
    SecurityGroupRule,
    /// Managed database instance.
    DbInstance,
    /// Secret (credentials, tokens).
    Secret,
    /// Object storage bucket.
    Bucket,
    /// Application load balancer.
    LoadBalancer,
    /// Load balancer target group.
    TargetGroup,
    /// Load balancer listener.
    Listener,
    /// Container image repository.
    ContainerRepository,
    /// Container cluster.
    Cluster,
    /// Log group.
    LogGroup,
    /// Container task definition.
    TaskDefinition,
    /// Long-running container service.
    Service,
    /// CDN cache policy.
    CachePolicy,
    /// CDN distribution.
    Distribution,
    /// Web application firewall ACL.
    WebAcl,
    /// Anything else; every list property is order-sensitive.
    Custom,
}

impl ResourceKind {
    /// Every kind, in declaration order.
    pub const ALL: &'static [Self] = &[
        Self::Vpc,
        Self::Subnet,
        Self::SecurityGroup,
        Self::SecurityGroupRule,
        Self::DbInstance,
        Self::Secret,
        Self::Bucket,
        Self::LoadBalancer,
        Self::TargetGroup,
        Self::Listener,
        Self::ContainerRepository,
        Self::Cluster,
        Self::LogGroup,
        Self::TaskDefinition,
        Self::Service,
        Self::CachePolicy,
        Self::Distribution,
        Self::WebAcl,
        Self::Custom,
    ];

    /// Properties whose list values are compared element-by-element in order.
    ///
    /// Every other list-valued property is compared as an unordered multiset:
    ///
    /// | kind              | order-sensitive                          |
    /// |-------------------|------------------------------------------|
    /// | `task_definition` | `containers`, `command`, `entry_point`   |
    /// | `listener`        | `rules`                                  |
    /// | `distribution`    | `behaviors`, `origins`                   |
    /// | `web_acl`         | `rules`                                  |
    /// | `service`         | `load_balancers`                         |
    /// | `custom`          | all                                      |
    #[must_use]
    pub const fn ordered_properties(self) -> &'static [&'static str] {
        match self {
            Self::TaskDefinition => &["containers", "command", "entry_point"],
            Self::Listener | Self::WebAcl => &["rules"],
            Self::Distribution => &["behaviors", "origins"],
            Self::Service => &["load_balancers"],
            _ => &[],
        }
    }

    /// Returns true if list values of `property` must keep their order.
    #[must_use]
    pub fn is_order_sensitive(self, property: &str) -> bool {
        self == Self::Custom || self.ordered_properties().contains(&property)
    }

    /// Properties a declaration of this kind is expected to carry.
    #[must_use]
    pub const fn expected_properties(self) -> &'static [&'static str] {
        match self {
            Self::Vpc => &["cidr"],
            Self::Subnet => &["vpc_id", "cidr"],
            Self::SecurityGroup => &["vpc_id"],
            Self::SecurityGroupRule => &["security_group_id", "port"],
            Self::DbInstance => &["engine", "instance_class"],
            Self::TargetGroup => &["vpc_id", "port"],
            Self::Listener => &["load_balancer_arn", "port"],
            Self::TaskDefinition => &["containers"],
            Self::Service => &["cluster", "task_definition"],
            Self::Distribution => &["origins"],
            _ => &[],
        }
    }

    /// Short prefix used for generated provider identifiers.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "sg",
            Self::SecurityGroupRule => "sgr",
            Self::DbInstance => "db",
            Self::Secret => "secret",
            Self::Bucket => "bucket",
            Self::LoadBalancer => "alb",
            Self::TargetGroup => "tg",
            Self::Listener => "lsn",
            Self::ContainerRepository => "repo",
            Self::Cluster => "cluster",
            Self::LogGroup => "logs",
            Self::TaskDefinition => "taskdef",
            Self::Service => "svc",
            Self::CachePolicy => "cp",
            Self::Distribution => "cdn",
            Self::WebAcl => "acl",
            Self::Custom => "res",
        }
    }

    /// Returns true if resources of this kind expose a DNS name.
    #[must_use]
    pub const fn has_dns_name(self) -> bool {
        matches!(self, Self::LoadBalancer | Self::Distribution | Self::DbInstance)
    }

    /// Returns the `snake_case` name used in declarations.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security_group",
            Self::SecurityGroupRule => "security_group_rule",
            Self::DbInstance => "db_instance",
            Self::Secret => "secret",
            Self::Bucket => "bucket",
            Self::LoadBalancer => "load_balancer",
            Self::TargetGroup => "target_group",
            Self::Listener => "listener",
            Self::ContainerRepository => "container_repository",
            Self::Cluster => "cluster",
            Self::LogGroup => "log_group",
            Self::TaskDefinition => "task_definition",
            Self::Service => "service",
            Self::CachePolicy => "cache_policy",
            Self::Distribution => "distribution",
            Self::WebAcl => "web_acl",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
