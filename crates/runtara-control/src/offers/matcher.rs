// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! First-fit matching of task descriptors onto resource offers.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ChannelBinding, Launch, LaunchCommand, MACHINE_ID_ATTRIBUTE, Offer, Ranges, Resources,
    TaskDescriptor,
};
use crate::ids::TaskId;
use crate::workflow::{Addressing, ControlMode};

/// Port floors used when assigning dynamic ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherConfig {
    /// Lowest port handed out to TCP inbound channels.
    pub tcp_port_min: u64,
    /// Lowest port handed out as a control port.
    pub control_port_min: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            tcp_port_min: 9000,
            control_port_min: 30000,
        }
    }
}

/// Result of one matching pass.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Offers to accept, each with the launches placed on it, in offer order.
    pub accepted: Vec<(String, Vec<Launch>)>,
    /// Offers nothing was placed on.
    pub declined: Vec<String>,
    /// Descriptors pinned to a machine no offer came from.
    pub undeployable: Vec<TaskDescriptor>,
}

impl MatchOutcome {
    /// All launches, in offer order.
    pub fn launches(&self) -> impl Iterator<Item = &Launch> {
        self.accepted.iter().flat_map(|(_, launches)| launches)
    }
}

/// Matches descriptors to offers.
#[derive(Debug, Clone, Default)]
pub struct OfferMatcher {
    config: MatcherConfig,
}

/// Remaining resources of an offer during a pass.
struct Remaining {
    cpu: f64,
    memory: f64,
    ports: Ranges,
}

impl OfferMatcher {
    /// Matcher with the given port floors.
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Run one pass. Matched descriptors are removed from `descriptors`;
    /// everything left over stays pending for the next batch of offers.
    pub fn match_offers(
        &self,
        descriptors: &mut Vec<TaskDescriptor>,
        offers: &[Offer],
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        // Pinned descriptors go to the offer of the machine they are pinned to.
        let mut pinned: BTreeMap<usize, Vec<TaskDescriptor>> = BTreeMap::new();
        let mut general = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors.drain(..) {
            let Some(machine) = descriptor.constraints.get(MACHINE_ID_ATTRIBUTE) else {
                general.push(descriptor);
                continue;
            };
            match offers
                .iter()
                .position(|o| o.attributes.get(MACHINE_ID_ATTRIBUTE) == Some(machine.value.as_str()))
            {
                Some(idx) => pinned.entry(idx).or_default().push(descriptor),
                None => {
                    warn!(
                        role = %descriptor.role_path,
                        machine_id = %machine.value,
                        "no offer from pinned machine, task is undeployable"
                    );
                    outcome.undeployable.push(descriptor);
                }
            }
        }

        for (idx, offer) in offers.iter().enumerate() {
            let mut remaining = Remaining {
                cpu: offer.cpu,
                memory: offer.memory,
                ports: offer.ports.clone(),
            };
            let executor_id = match offer.executor_ids.as_slice() {
                [] => Uuid::new_v4().to_string(),
                [first, rest @ ..] => {
                    if !rest.is_empty() {
                        warn!(
                            offer = %offer.id,
                            count = offer.executor_ids.len(),
                            "offer has more than one executor, using the first"
                        );
                    }
                    first.clone()
                }
            };

            let mut launches = Vec::new();
            let mut own = pinned.remove(&idx).unwrap_or_default();
            self.place(offer, &executor_id, &mut remaining, &mut own, &mut launches);
            // Pinned descriptors that did not fit wait for the next pass.
            descriptors.append(&mut own);
            self.place(offer, &executor_id, &mut remaining, &mut general, &mut launches);

            if launches.is_empty() {
                outcome.declined.push(offer.id.clone());
            } else {
                debug!(offer = %offer.id, host = %offer.hostname, launches = launches.len(), "offer matched");
                outcome.accepted.push((offer.id.clone(), launches));
            }
        }

        descriptors.append(&mut general);
        outcome
    }

    /// Place as many of `pending` as fit on the offer, walking backward.
    fn place(
        &self,
        offer: &Offer,
        executor_id: &str,
        remaining: &mut Remaining,
        pending: &mut Vec<TaskDescriptor>,
        launches: &mut Vec<Launch>,
    ) {
        let mut i = pending.len();
        while i > 0 {
            i -= 1;
            let descriptor = &pending[i];
            if !offer.attributes.satisfy(&descriptor.constraints) {
                debug!(role = %descriptor.role_path, offer = %offer.id, "constraints not satisfied");
                continue;
            }
            let class = &descriptor.class;
            if class.cpu > remaining.cpu
                || class.memory > remaining.memory
                || !remaining.ports.contains(&class.ports)
            {
                debug!(role = %descriptor.role_path, offer = %offer.id, "insufficient resources");
                continue;
            }
            match self.build_launch(offer, executor_id, remaining, descriptor) {
                Some(launch) => {
                    pending.remove(i);
                    launches.push(launch);
                }
                None => {
                    debug!(role = %descriptor.role_path, offer = %offer.id, "not enough dynamic ports");
                }
            }
        }
    }

    /// Build the launch of `descriptor` and take its resources from
    /// `remaining`. Nothing is taken when the dynamic ports run out.
    fn build_launch(
        &self,
        offer: &Offer,
        executor_id: &str,
        remaining: &mut Remaining,
        descriptor: &TaskDescriptor,
    ) -> Option<Launch> {
        let class = &descriptor.class;
        let mut free = remaining.ports.clone();
        free.subtract(&class.ports);
        let mut assigned = Vec::new();

        let mut bindings = Vec::with_capacity(class.bind.len());
        for channel in &class.bind {
            let address = match (&channel.target, channel.addressing) {
                (Some(target), _) if !target.is_empty() => target.clone(),
                (_, Addressing::Ipc) => format!("ipc:///tmp/o2ipc-{}", Uuid::new_v4().simple()),
                (_, Addressing::Tcp) => {
                    let port = free.take_from(self.config.tcp_port_min)?;
                    assigned.push(port);
                    format!("tcp://{}:{}", offer.hostname, port)
                }
            };
            if let Some(global) = &channel.global {
                bindings.push(ChannelBinding {
                    name: format!("::{global}"),
                    address: address.clone(),
                });
            }
            bindings.push(ChannelBinding {
                name: channel.name.clone(),
                address,
            });
        }

        let control_port = free.take_from(self.config.control_port_min)?;
        assigned.push(control_port);

        let mut env = class.env.clone();
        env.entry("O2_ROLE".into())
            .or_insert_with(|| offer.hostname.clone());
        env.entry("O2_SYSTEM".into()).or_insert_with(|| "FLP".into());
        env.insert("OCC_CONTROL_PORT".into(), control_port.to_string());
        let mut args = class.args.clone();
        if class.control == ControlMode::Fairmq {
            args.push("--control-port".into());
            args.push(control_port.to_string());
        }

        let mut labels = BTreeMap::from([("environmentId".to_string(), descriptor.env_id.to_string())]);
        if let Some(detector) = &descriptor.detector {
            labels.insert("detector".into(), detector.clone());
        }

        let ports = Ranges::new(
            class
                .ports
                .iter()
                .copied()
                .chain(assigned.iter().map(|&p| super::PortRange::new(p, p))),
        );
        remaining.ports = free;
        remaining.cpu -= class.cpu;
        remaining.memory -= class.memory;

        Some(Launch {
            task_id: TaskId::new(),
            env_id: descriptor.env_id,
            role_path: descriptor.role_path.clone(),
            offer_id: offer.id.clone(),
            hostname: offer.hostname.clone(),
            executor_id: executor_id.to_string(),
            command: LaunchCommand {
                value: class.command.clone(),
                args,
                env,
            },
            resources: Resources {
                cpu: class.cpu,
                memory: class.memory,
                ports,
            },
            limits: class.limits,
            labels,
            control_port,
            bindings,
            connect: class.connect.clone(),
            critical: descriptor.critical,
        })
    }
}
