use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, trace};

use super::{
    error::{Error, Result},
    grid::NodeData,
    hex::HexDisplayExt,
    node::DataSource,
    partition::{Resolution, SpatialPartition},
    space::Point,
    table::ClusterTable,
};

/// Identity shared by the client's handle and every node's copy of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleToken([u8; 16]);

impl HandleToken {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for HandleToken {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for HandleToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleToken({})", self.hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Node,
}

/// What a handle can do given its role and setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// No partition: data is fully local.
    Local,
    /// A node holding one partition slot.
    Partitioned,
    /// The client, whose data is spread over the table's workers.
    Distributed,
}

/// Which participant owns a point.
#[derive(Debug, PartialEq, Eq)]
pub enum Owner<'a, E> {
    /// The handle has no partition, so everything is local.
    Local,
    Slot { slot: usize, endpoint: &'a E },
    Unowned,
}

/// The client's setup as shipped to every participant: the handle's
/// identity, its partition, and the table as registry locations.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct SessionSetup {
    pub token: [u8; 16],
    pub partition: Option<SpatialPartition>,
    pub locations: Vec<String>,
}

impl SessionSetup {
    /// A node's copy of the published handle, already set up.
    pub fn into_handle(self) -> Result<ClusterDataHandle<String>> {
        let mut handle = ClusterDataHandle::node(HandleToken(self.token));
        handle.setup(self.partition, Some(ClusterTable::new(self.locations)?))?;
        Ok(handle)
    }
}

#[derive(Debug)]
struct ClusterState<E> {
    partition: Option<SpatialPartition>,
    table: ClusterTable<E>,
}

/// Wraps a data object so it can live on the client or on a node, knows the
/// session's partition and endpoint table, and propagates change
/// notifications to any enclosing handle.
///
/// `E` is whatever the table stores per slot; the runtime uses
/// [`Link`](super::Link).
pub struct ClusterDataHandle<E> {
    token: HandleToken,
    role: Role,
    cluster: Option<ClusterState<E>>,
    data: RwLock<Option<Arc<NodeData>>>,
    parent: Option<Weak<ClusterDataHandle<E>>>,
    revision: watch::Sender<u64>,
}

impl<E> ClusterDataHandle<E> {
    pub fn new(role: Role, token: HandleToken) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            token,
            role,
            cluster: None,
            data: RwLock::new(None),
            parent: None,
            revision,
        }
    }

    /// A fresh client handle with a new identity.
    pub fn client() -> Self {
        Self::new(Role::Client, HandleToken::random())
    }

    /// A node's copy of the client handle identified by `token`.
    pub fn node(token: HandleToken) -> Self {
        Self::new(Role::Node, token)
    }

    pub fn token(&self) -> HandleToken {
        self.token
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Installs the partition and table. Both are validated before anything
    /// is assigned, so a failed setup leaves earlier state untouched.
    pub fn setup(
        &mut self,
        partition: Option<SpatialPartition>,
        table: Option<ClusterTable<E>>,
    ) -> Result<()> {
        let table = table.ok_or_else(|| Error::config("cluster table is required"))?;
        if let Some(partition) = &partition {
            table.check_fits(partition.size())?;
        }
        debug!(
            token = %self.token.hex(),
            role = ?self.role,
            slots = partition.as_ref().map(|p| p.size()),
            endpoints = table.len(),
            "cluster handle set up"
        );
        self.cluster = Some(ClusterState { partition, table });
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn capability(&self) -> Capability {
        match (&self.cluster, self.role) {
            (Some(ClusterState { partition: Some(_), .. }), Role::Node) => {
                Capability::Partitioned
            }
            (Some(ClusterState { partition: Some(_), .. }), Role::Client) => {
                Capability::Distributed
            }
            _ => Capability::Local,
        }
    }

    pub fn partition(&self) -> Option<&SpatialPartition> {
        self.cluster.as_ref()?.partition.as_ref()
    }

    pub fn table(&self) -> Option<&ClusterTable<E>> {
        self.cluster.as_ref().map(|c| &c.table)
    }

    /// Number of worker slots, zero without a partition.
    pub fn workers(&self) -> usize {
        self.partition().map_or(0, SpatialPartition::size)
    }

    /// Resolves the participant owning `point`. Points outside the
    /// partition's space map to the table's final slot.
    pub fn owner(&self, point: &Point) -> Result<Owner<'_, E>> {
        let cluster = self
            .cluster
            .as_ref()
            .ok_or_else(|| Error::config("lookup before setup"))?;
        let Some(partition) = &cluster.partition else {
            return Ok(Owner::Local);
        };
        let slot = match partition.resolve(point) {
            Resolution::Slot(slot) => slot,
            Resolution::Fallback => cluster.table.fallback_slot(),
            Resolution::Unowned => return Ok(Owner::Unowned),
        };
        let endpoint = cluster.table.get(slot).ok_or_else(|| {
            Error::config(format!("no endpoint for slot {}", slot))
        })?;
        Ok(Owner::Slot { slot, endpoint })
    }

    /// What the nodes need to mirror this handle's setup, naming each table
    /// entry by `locate`. `None` before setup.
    pub fn session_setup(&self, locate: impl Fn(&E) -> String) -> Option<SessionSetup> {
        let cluster = self.cluster.as_ref()?;
        Some(SessionSetup {
            token: *self.token.bytes(),
            partition: cluster.partition.clone(),
            locations: cluster.table.iter().map(locate).collect(),
        })
    }

    /// True when both handles stand for the same cluster-wide object.
    pub fn cluster_eq(&self, other: &ClusterDataHandle<E>) -> bool {
        self.token == other.token
    }

    pub fn set_parent(&mut self, parent: &Arc<ClusterDataHandle<E>>) {
        self.parent = Some(Arc::downgrade(parent));
    }

    pub async fn data(&self) -> Option<Arc<NodeData>> {
        self.data.read().await.clone()
    }

    /// Replaces the wrapped data and notifies every reference.
    pub async fn set_data(&self, data: Option<NodeData>) {
        *self.data.write().await = data.map(Arc::new);
        self.notify_references();
    }

    /// Bumps the revision of this handle and of each enclosing handle.
    pub fn notify_references(&self) {
        self.revision.send_modify(|r| *r += 1);
        trace!(token = %self.token.short_hex(), revision = self.revision(), "data changed");
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.notify_references();
        }
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

impl<E> fmt::Debug for ClusterDataHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterDataHandle")
            .field("token", &self.token)
            .field("role", &self.role)
            .field("capability", &self.capability())
            .field("revision", &self.revision())
            .finish()
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> DataSource for ClusterDataHandle<E> {
    async fn load(&self) -> Result<Option<Arc<NodeData>>> {
        Ok(self.data().await)
    }

    fn watch(&self) -> Option<watch::Receiver<u64>> {
        Some(self.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        grid::{Field, Grid3},
        partition::LinearAxis,
        space::CoordSpace,
    };

    fn quadrants() -> SpatialPartition {
        SpatialPartition::linear(
            CoordSpace::meters(2),
            vec![LinearAxis::new(0., 10., 2), LinearAxis::new(0., 10., 2)],
        )
        .unwrap()
    }

    fn table(n: usize) -> ClusterTable<String> {
        ClusterTable::new((0..n).map(|k| format!("n{}", k)).collect()).unwrap()
    }

    fn at(x: f64, y: f64) -> Point {
        Point::new(vec![x, y], CoordSpace::meters(2))
    }

    #[test]
    fn lookup_before_setup_fails_without_side_effects() {
        let handle = ClusterDataHandle::<String>::client();
        assert!(matches!(
            handle.owner(&at(1., 1.)),
            Err(Error::Configuration(_))
        ));
        assert!(!handle.is_setup());
        assert!(handle.table().is_none());
    }

    #[test]
    fn setup_validates_before_assigning() {
        let mut handle = ClusterDataHandle::client();
        handle.setup(None, Some(table(1))).unwrap();
        assert_eq!(handle.capability(), Capability::Local);

        // four workers need five endpoints
        assert!(handle.setup(Some(quadrants()), Some(table(4))).is_err());
        assert!(handle.setup(Some(quadrants()), None).is_err());
        assert_eq!(handle.table().unwrap().len(), 1);
        assert!(handle.partition().is_none());

        handle.setup(Some(quadrants()), Some(table(5))).unwrap();
        assert_eq!(handle.capability(), Capability::Distributed);
        assert_eq!(handle.workers(), 4);
    }

    #[test]
    fn owners_follow_partition() {
        let mut handle = ClusterDataHandle::node(HandleToken::random());
        handle.setup(Some(quadrants()), Some(table(5))).unwrap();
        assert_eq!(handle.capability(), Capability::Partitioned);

        let owner = handle.owner(&at(7.5, 2.5)).unwrap();
        assert_eq!(
            owner,
            Owner::Slot {
                slot: 1,
                endpoint: &"n1".to_string()
            }
        );

        let far = Point::new(vec![1., 1., 1.], CoordSpace::meters(3));
        assert!(matches!(handle.owner(&far), Ok(Owner::Slot { slot: 4, .. })));
        assert_eq!(handle.owner(&at(40., 1.)).unwrap(), Owner::Unowned);
    }

    #[test]
    fn published_setups_rebuild_the_handle() {
        let mut client = ClusterDataHandle::<String>::client();
        assert!(client.session_setup(String::clone).is_none());
        client.setup(Some(quadrants()), Some(table(5))).unwrap();

        let setup = client.session_setup(|e| e.to_uppercase()).unwrap();
        assert_eq!(setup.locations[4], "N4");
        let node = setup.clone().into_handle().unwrap();
        assert!(node.cluster_eq(&client));
        assert_eq!(node.role(), Role::Node);
        assert_eq!(node.capability(), Capability::Partitioned);
        assert!(matches!(
            node.owner(&at(2.5, 7.5)),
            Ok(Owner::Slot { slot: 2, endpoint }) if endpoint == "N2"
        ));

        // a table with no fallback slot is refused on the node too
        let locations = setup.locations[..4].to_vec();
        let short = SessionSetup { locations, ..setup };
        assert!(matches!(short.into_handle(), Err(Error::Configuration(_))));
    }

    #[test]
    fn local_handles_own_everything() {
        let mut handle = ClusterDataHandle::client();
        handle.setup(None, Some(table(1))).unwrap();
        assert_eq!(handle.owner(&at(1e6, 1e6)).unwrap(), Owner::Local);
    }

    #[test]
    fn copies_share_identity() {
        let client = ClusterDataHandle::<String>::client();
        let node = ClusterDataHandle::<String>::node(client.token());
        let other = ClusterDataHandle::<String>::client();
        assert!(client.cluster_eq(&node));
        assert!(!client.cluster_eq(&other));
    }

    #[tokio::test]
    async fn changes_propagate_to_parents() {
        let parent = Arc::new(ClusterDataHandle::<String>::client());
        let mut child = ClusterDataHandle::node(parent.token());
        child.set_parent(&parent);
        let mut rx = parent.subscribe();

        let grid = Grid3::linear([0.; 3], [1.; 3], [2; 3], CoordSpace::meters(3)).unwrap();
        child
            .set_data(Some(NodeData::Field(Field::from_fn("t", grid, |p| p[0]))))
            .await;

        assert_eq!(child.revision(), 1);
        assert_eq!(parent.revision(), 1);
        assert!(rx.has_changed().unwrap());
        assert!(child.load().await.unwrap().is_some());
    }
}
