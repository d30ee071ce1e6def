use crate::config::ConnectionStrategy;
use crate::conn::{BindState, ConnectionHandle, ConnectionManager, Connector, Session};
use crate::error::{RouterError, SwitchError};
use crate::provision::CatalogDirectory;
use crate::tenant::{CatalogName, TenantId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSlot {
    Root,
    Alternate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStats {
    pub switch_commands: u64,
    pub retries: u64,
    pub connects: u64,
    pub closes: u64,
}

enum HandleSet<S> {
    Single {
        handle: Option<ConnectionHandle<S>>,
    },
    Dual {
        root: Option<ConnectionHandle<S>>,
        alternate: Option<ConnectionHandle<S>>,
        active: ActiveSlot,
    },
}

pub struct CatalogSwitch<C: Connector> {
    manager: ConnectionManager<C>,
    handles: HandleSet<C::Session>,
    stats: SwitchStats,
}

impl<C: Connector> CatalogSwitch<C> {
    pub fn new(manager: ConnectionManager<C>) -> Self {
        let handles = match manager.config().strategy {
            ConnectionStrategy::Single => HandleSet::Single { handle: None },
            ConnectionStrategy::Dual => HandleSet::Dual {
                root: None,
                alternate: None,
                active: ActiveSlot::Root,
            },
        };
        Self {
            manager,
            handles,
            stats: SwitchStats::default(),
        }
    }

    pub fn strategy(&self) -> ConnectionStrategy {
        match self.handles {
            HandleSet::Single { .. } => ConnectionStrategy::Single,
            HandleSet::Dual { .. } => ConnectionStrategy::Dual,
        }
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    pub fn active_slot(&self) -> Option<ActiveSlot> {
        match &self.handles {
            HandleSet::Single { .. } => None,
            HandleSet::Dual { active, .. } => Some(*active),
        }
    }

    pub fn active(&self) -> Option<&ConnectionHandle<C::Session>> {
        match &self.handles {
            HandleSet::Single { handle } => handle.as_ref(),
            HandleSet::Dual {
                root,
                alternate,
                active,
            } => match active {
                ActiveSlot::Root => root.as_ref(),
                ActiveSlot::Alternate => alternate.as_ref(),
            },
        }
    }

    fn active_mut(&mut self) -> Option<&mut ConnectionHandle<C::Session>> {
        match &mut self.handles {
            HandleSet::Single { handle } => handle.as_mut(),
            HandleSet::Dual {
                root,
                alternate,
                active,
            } => match active {
                ActiveSlot::Root => root.as_mut(),
                ActiveSlot::Alternate => alternate.as_mut(),
            },
        }
    }

    pub fn root_handle(&self) -> Option<&ConnectionHandle<C::Session>> {
        match &self.handles {
            HandleSet::Single { handle } => handle.as_ref(),
            HandleSet::Dual { root, .. } => root.as_ref(),
        }
    }

    pub fn alternate_handle(&self) -> Option<&ConnectionHandle<C::Session>> {
        match &self.handles {
            HandleSet::Single { .. } => None,
            HandleSet::Dual { alternate, .. } => alternate.as_ref(),
        }
    }

    pub fn connect(&mut self) -> Result<(), RouterError> {
        let slot = match &mut self.handles {
            HandleSet::Single { handle } => handle,
            HandleSet::Dual { root, .. } => root,
        };
        if slot.is_none() {
            *slot = Some(self.manager.open(&CatalogName::root())?);
            self.stats.connects += 1;
        }
        Ok(())
    }

    /// Returns the handle that must run the next query for `tenant`, bound
    /// to the tenant's catalog. Issues no engine round trip when the active
    /// handle is already bound there.
    pub fn ensure_bound(
        &mut self,
        tenant: TenantId,
        directory: Option<&dyn CatalogDirectory>,
    ) -> Result<&mut ConnectionHandle<C::Session>, RouterError> {
        let target = tenant.catalog();
        let bound = self.active().is_some_and(|h| h.is_bound_to(&target));

        if !bound {
            match &mut self.handles {
                HandleSet::Single { handle } => bind_single(
                    &mut self.manager,
                    &mut self.stats,
                    handle,
                    &target,
                    directory,
                )?,
                HandleSet::Dual {
                    root,
                    alternate,
                    active,
                } => bind_dual(
                    &mut self.manager,
                    &mut self.stats,
                    root,
                    alternate,
                    active,
                    &target,
                    directory,
                )?,
            }
        }

        let handle = self.active_mut().ok_or_else(|| SwitchError::TargetCatalogMissing {
            catalog: target.clone(),
            reason: "no active connection".into(),
        })?;
        if !handle.is_bound_to(&target) {
            return Err(SwitchError::TargetCatalogMissing {
                catalog: target,
                reason: format!("connection {} is not bound to it", handle.id()),
            }
            .into());
        }
        Ok(handle)
    }

    pub fn invalidate_active(&mut self) {
        if let Some(handle) = self.active_mut() {
            warn!(handle = handle.id(), "connection binding invalidated");
            handle.set_state(BindState::Unbound);
        }
    }

    pub fn shutdown(mut self) {
        match &mut self.handles {
            HandleSet::Single { handle } => {
                if let Some(h) = handle.take() {
                    h.close();
                }
            }
            HandleSet::Dual {
                root, alternate, ..
            } => {
                for h in [alternate.take(), root.take()].into_iter().flatten() {
                    h.close();
                }
            }
        }
    }
}

fn bind_single<C: Connector>(
    manager: &mut ConnectionManager<C>,
    stats: &mut SwitchStats,
    slot: &mut Option<ConnectionHandle<C::Session>>,
    target: &CatalogName,
    directory: Option<&dyn CatalogDirectory>,
) -> Result<(), RouterError> {
    if slot.is_none() {
        *slot = Some(manager.open(&CatalogName::root())?);
        stats.connects += 1;
    }
    let Some(handle) = slot.as_mut() else {
        return Ok(());
    };
    if handle.is_bound_to(target) {
        return Ok(());
    }

    verify_exists(directory, target)?;
    let database = manager.config().database.clone();
    switch_in_place(handle, target, &database, stats)?;
    Ok(())
}

fn switch_in_place<S: Session>(
    handle: &mut ConnectionHandle<S>,
    target: &CatalogName,
    database: &str,
    stats: &mut SwitchStats,
) -> Result<(), SwitchError> {
    let use_catalog = format!("USE CATALOG {target}");
    stats.switch_commands += 1;

    let outcome = match handle.execute(&use_catalog) {
        Err(err) if err.is_transient() => {
            warn!(handle = handle.id(), %target, error = %err, "catalog switch failed, retrying once");
            stats.retries += 1;
            handle.execute(&use_catalog)
        }
        other => other,
    };
    match outcome {
        Ok(_) => {}
        // The command may or may not have reached the engine.
        Err(err) if err.is_transient() => {
            handle.set_state(BindState::Unbound);
            return Err(SwitchError::SwitchInterrupted {
                catalog: target.clone(),
                reason: err.to_string(),
            });
        }
        Err(err) => {
            return Err(SwitchError::TargetCatalogMissing {
                catalog: target.clone(),
                reason: err.to_string(),
            })
        }
    }

    // Catalog changed but the working database is not selected yet.
    handle.set_state(BindState::Unbound);
    let use_database = format!("USE `{}`", database.replace('`', "``"));
    handle
        .execute(&use_database)
        .map_err(|err| SwitchError::DatabaseMissing {
            catalog: target.clone(),
            database: database.to_string(),
            reason: err.to_string(),
        })?;

    handle.set_state(BindState::BoundTo(target.clone()));
    debug!(handle = handle.id(), %target, "switched catalog");
    Ok(())
}

fn bind_dual<C: Connector>(
    manager: &mut ConnectionManager<C>,
    stats: &mut SwitchStats,
    root: &mut Option<ConnectionHandle<C::Session>>,
    alternate: &mut Option<ConnectionHandle<C::Session>>,
    active: &mut ActiveSlot,
    target: &CatalogName,
    directory: Option<&dyn CatalogDirectory>,
) -> Result<(), RouterError> {
    if root.is_none() {
        *root = Some(manager.open(&CatalogName::root())?);
        stats.connects += 1;
    }
    if target.is_root() {
        if let Some(handle) = root.as_mut().filter(|h| !h.is_bound_to(target)) {
            let database = manager.config().database.clone();
            switch_in_place(handle, target, &database, stats)?;
        }
        *active = ActiveSlot::Root;
        return Ok(());
    }
    if alternate.as_ref().is_some_and(|h| h.is_bound_to(target)) {
        *active = ActiveSlot::Alternate;
        return Ok(());
    }

    verify_exists(directory, target)?;

    *active = ActiveSlot::Root;
    let stale = alternate.take().map(|handle| {
        let bound = handle
            .bound_catalog()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "an unknown catalog".into());
        debug!(handle = handle.id(), stale = %bound, %target, "discarding stale alternate connection");
        handle.close();
        stats.closes += 1;
        bound
    });

    let fresh = manager.connect(target).map_err(|err| match stale {
        Some(stale) => RouterError::from(SwitchError::StaleHandleReconnectFailed {
            catalog: target.clone(),
            stale,
            source: err,
        }),
        None if err.is_unknown_database() => RouterError::from(SwitchError::TargetCatalogMissing {
            catalog: target.clone(),
            reason: err.to_string(),
        }),
        None => RouterError::Connection(err),
    })?;
    stats.connects += 1;

    *alternate = Some(fresh);
    *active = ActiveSlot::Alternate;
    Ok(())
}

fn verify_exists(
    directory: Option<&dyn CatalogDirectory>,
    target: &CatalogName,
) -> Result<(), RouterError> {
    let Some(directory) = directory else {
        return Ok(());
    };
    if target.is_root() {
        return Ok(());
    }
    match directory.contains(target) {
        Ok(true) => Ok(()),
        Ok(false) => Err(SwitchError::TargetCatalogMissing {
            catalog: target.clone(),
            reason: "not listed by the provisioner".into(),
        }
        .into()),
        Err(source) => Err(RouterError::TenantUnavailable {
            catalog: target.clone(),
            source,
        }),
    }
}
