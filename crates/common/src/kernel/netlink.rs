use std::net::IpAddr;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_utils::nla::{DefaultNla, Nla};
use rtnetlink::Handle;

use crate::error::{Error, Result};

/// The link kinds the daemon creates. `Xfrm` and `Wireguard` have no
/// builder in `rtnetlink` itself (pyroute2 hand-builds the same `IFLA_INFO_*`
/// nested attributes on the Python side), so they're assembled here as raw
/// NLAs the same way the original constructs its `NDB.interfaces.create`
/// keyword arguments.
#[derive(Debug, Clone)]
pub enum LinkKind {
    /// A veth pair; `peer` is the name given to the namespace-side end.
    Veth { peer: String },
    /// An XFRM interface bound to `underlying_if_index`, tagged `if_id`
    /// (matches the SA's `mark`/`if_id` so the kernel can demux traffic
    /// between tunnels sharing one physical uplink).
    Xfrm {
        underlying_if_index: u32,
        if_id: u32,
    },
    /// A WireGuard device. Peer and key configuration happens separately
    /// through the adapter layer, not netlink.
    Wireguard,
    /// A pre-existing interface adopted as-is (`PhysicalConfig`).
    Existing,
}

#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub name: String,
    pub kind: LinkKind,
}

#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub oif: u32,
    pub table: Option<u32>,
}

fn raw_nla(kind: u16, value: Vec<u8>) -> DefaultNla {
    DefaultNla::new(kind, value)
}

// IFLA_INFO_KIND / IFLA_INFO_DATA nest under IFLA_LINKINFO (18).
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
// IFLA_XFRM_LINK / IFLA_XFRM_IF_ID, relative to the xfrm IFLA_INFO_DATA nest.
const IFLA_XFRM_LINK: u16 = 1;
const IFLA_XFRM_IF_ID: u16 = 2;

fn nest(kind: u16, children: Vec<Box<dyn Nla>>) -> DefaultNla {
    let mut buf = Vec::new();
    for child in &children {
        let mut child_buf = vec![0u8; child.value_len() + 4];
        child.emit(&mut child_buf);
        buf.extend_from_slice(&child_buf[..child.value_len() + 4]);
    }
    raw_nla(kind, buf)
}

fn str_nla(kind: u16, s: &str) -> DefaultNla {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    raw_nla(kind, v)
}

fn u32_nla(kind: u16, v: u32) -> DefaultNla {
    raw_nla(kind, v.to_ne_bytes().to_vec())
}

/// A handle into one network namespace's netlink socket. Callers hold one
/// per active network instance (§5); namespace entry happens once, at
/// construction, via [`super::netns::NetworkNamespace`].
#[derive(Clone)]
pub struct NetlinkHandle {
    handle: Handle,
}

impl NetlinkHandle {
    /// Spawns the netlink connection on the current task's runtime and
    /// returns a handle to it. Must be called after the caller has already
    /// entered the target namespace (`setns`), since `rtnetlink::new_connection`
    /// opens its socket in the namespace active on the calling thread.
    pub fn open() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| Error::transient("open netlink socket", e))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.code.map(|c| c.get()) == Some(-19) => {
                Ok(None)
            }
            Err(e) => Err(Error::transient("link get", std::io::Error::other(e))),
        }
    }

    pub async fn link_add(&self, spec: &LinkSpec) -> Result<()> {
        match &spec.kind {
            LinkKind::Veth { peer } => {
                self.handle
                    .link()
                    .add()
                    .veth(spec.name.clone(), peer.clone())
                    .execute()
                    .await
                    .map_err(|e| Error::transient("veth add", std::io::Error::other(e)))?;
            }
            LinkKind::Xfrm {
                underlying_if_index,
                if_id,
            } => {
                let info_data = nest(
                    IFLA_INFO_DATA,
                    vec![
                        Box::new(u32_nla(IFLA_XFRM_LINK, *underlying_if_index)),
                        Box::new(u32_nla(IFLA_XFRM_IF_ID, *if_id)),
                    ],
                );
                let link_info = nest(
                    IFLA_LINKINFO,
                    vec![Box::new(str_nla(IFLA_INFO_KIND, "xfrm")), Box::new(info_data)],
                );
                let mut message = LinkMessage::default();
                message.attributes.push(LinkAttribute::IfName(spec.name.clone()));
                message.attributes.push(LinkAttribute::Other(link_info));
                self.handle
                    .link()
                    .add(message)
                    .execute()
                    .await
                    .map_err(|e| Error::transient("xfrm link add", std::io::Error::other(e)))?;
            }
            LinkKind::Wireguard => {
                let link_info = nest(
                    IFLA_LINKINFO,
                    vec![Box::new(str_nla(IFLA_INFO_KIND, "wireguard"))],
                );
                let mut message = LinkMessage::default();
                message.attributes.push(LinkAttribute::IfName(spec.name.clone()));
                message.attributes.push(LinkAttribute::Other(link_info));
                self.handle
                    .link()
                    .add(message)
                    .execute()
                    .await
                    .map_err(|e| Error::transient("wireguard link add", std::io::Error::other(e)))?;
            }
            LinkKind::Existing => {}
        }
        Ok(())
    }

    pub async fn link_del(&self, if_index: u32) -> Result<()> {
        self.handle
            .link()
            .del(if_index)
            .execute()
            .await
            .map_err(|e| Error::transient("link del", std::io::Error::other(e)))
    }

    pub async fn link_set_up(&self, if_index: u32) -> Result<()> {
        self.handle
            .link()
            .set(if_index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::transient("link set up", std::io::Error::other(e)))
    }

    pub async fn link_set_down(&self, if_index: u32) -> Result<()> {
        self.handle
            .link()
            .set(if_index)
            .down()
            .execute()
            .await
            .map_err(|e| Error::transient("link set down", std::io::Error::other(e)))
    }

    pub async fn link_set_ns_pid(&self, if_index: u32, pid: u32) -> Result<()> {
        self.handle
            .link()
            .set(if_index)
            .setns_by_pid(pid)
            .execute()
            .await
            .map_err(|e| Error::transient("link set netns", std::io::Error::other(e)))
    }

    pub async fn addr_add(&self, if_index: u32, addr: IpNetwork) -> Result<()> {
        self.handle
            .address()
            .add(if_index, addr.ip(), addr.prefix())
            .execute()
            .await
            .map_err(|e| Error::transient("addr add", std::io::Error::other(e)))
    }

    pub async fn route_add(&self, route: &RouteSpec) -> Result<()> {
        use rtnetlink::RouteMessageBuilder;
        match route.destination {
            IpNetwork::V4(net) => {
                let mut builder = RouteMessageBuilder::<std::net::Ipv4Addr>::default()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(route.oif);
                if let Some(IpAddr::V4(gw)) = route.gateway {
                    builder = builder.gateway(gw);
                }
                if let Some(table) = route.table {
                    builder = builder.table_id(table);
                }
                self.handle
                    .route()
                    .add(builder.build())
                    .replace()
                    .execute()
                    .await
                    .map_err(|e| Error::transient("route add", std::io::Error::other(e)))?;
            }
            IpNetwork::V6(net) => {
                let mut builder = RouteMessageBuilder::<std::net::Ipv6Addr>::default()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(route.oif);
                if let Some(IpAddr::V6(gw)) = route.gateway {
                    builder = builder.gateway(gw);
                }
                if let Some(table) = route.table {
                    builder = builder.table_id(table);
                }
                self.handle
                    .route()
                    .add(builder.build())
                    .replace()
                    .execute()
                    .await
                    .map_err(|e| Error::transient("route add", std::io::Error::other(e)))?;
            }
        }
        Ok(())
    }
}
