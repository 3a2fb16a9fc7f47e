// Renderer registry - generational slab of owned renderers
//
// Handles carry the generation of the slot they were issued for. Removing a
// renderer bumps the slot generation, so a stale handle never matches again.

use std::fmt;

use super::Renderer;
use crate::error::{BackendError, ContractMode, Result};

/// Opaque reference to a registered renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendererHandle {
    index: u32,
    generation: u32,
}

impl RendererHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RendererHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Entry {
    generation: u32,
    renderer: Option<Box<dyn Renderer>>,
}

#[derive(Default)]
pub struct RendererRegistry {
    entries: Vec<Entry>,
    free: Vec<u32>,
    active: Option<RendererHandle>,
    contract: ContractMode,
}

impl RendererRegistry {
    pub fn new(contract: ContractMode) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            active: None,
            contract,
        }
    }

    pub fn set_contract_mode(&mut self, contract: ContractMode) {
        self.contract = contract;
    }

    pub fn add(&mut self, renderer: Box<dyn Renderer>) -> RendererHandle {
        let handle = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.renderer = Some(renderer);
                RendererHandle {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    renderer: Some(renderer),
                });
                RendererHandle { index, generation: 0 }
            }
        };
        log::debug!("Registered renderer {}", handle);
        handle
    }

    fn entry(&self, handle: RendererHandle) -> Option<&Entry> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation && entry.renderer.is_some())
    }

    pub fn contains(&self, handle: RendererHandle) -> bool {
        self.entry(handle).is_some()
    }

    pub fn get(&self, handle: RendererHandle) -> Result<&dyn Renderer> {
        match self.entry(handle).and_then(|entry| entry.renderer.as_deref()) {
            Some(renderer) => Ok(renderer),
            None => Err(self.contract.violation(BackendError::InvalidHandle(handle))),
        }
    }

    pub fn get_mut(&mut self, handle: RendererHandle) -> Result<&mut dyn Renderer> {
        if !self.contains(handle) {
            return Err(self.contract.violation(BackendError::InvalidHandle(handle)));
        }
        match self.entries[handle.index as usize].renderer.as_deref_mut() {
            Some(renderer) => Ok(renderer),
            None => Err(BackendError::InvalidHandle(handle)),
        }
    }

    /// Hands ownership back to the caller. The active renderer cannot be removed.
    pub fn remove(&mut self, handle: RendererHandle) -> Result<Box<dyn Renderer>> {
        if !self.contains(handle) {
            return Err(self.contract.violation(BackendError::InvalidHandle(handle)));
        }
        if self.active == Some(handle) {
            return Err(self.contract.violation(BackendError::ActiveRenderer(handle)));
        }

        let entry = &mut self.entries[handle.index as usize];
        let renderer = entry
            .renderer
            .take()
            .ok_or(BackendError::InvalidHandle(handle))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        log::debug!("Removed renderer {}", handle);
        Ok(renderer)
    }

    /// `None` makes render() a clear-only pass.
    pub fn set_active(&mut self, handle: Option<RendererHandle>) -> Result<()> {
        if let Some(handle) = handle {
            if !self.contains(handle) {
                return Err(self.contract.violation(BackendError::InvalidHandle(handle)));
            }
        }
        self.active = handle;
        Ok(())
    }

    pub fn active(&self) -> Option<RendererHandle> {
        self.active
    }

    pub fn active_mut(&mut self) -> Option<&mut dyn Renderer> {
        let handle = self.active?;
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.renderer.as_deref_mut().map(|renderer| renderer as &mut dyn Renderer))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.renderer.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<RendererHandle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.renderer.is_some())
            .map(|(index, entry)| RendererHandle {
                index: index as u32,
                generation: entry.generation,
            })
            .collect()
    }

    /// Remove every renderer, active one included, in registration-slot order.
    pub fn drain(&mut self) -> Vec<(RendererHandle, Box<dyn Renderer>)> {
        self.active = None;
        let mut drained = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(renderer) = entry.renderer.take() {
                drained.push((
                    RendererHandle {
                        index: index as u32,
                        generation: entry.generation,
                    },
                    renderer,
                ));
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        drained
    }

    /// Destroy all renderers. Generations survive, so old handles stay invalid.
    pub fn clear(&mut self) {
        let count = self.drain().len();
        if count > 0 {
            log::info!("Destroyed {} renderer(s)", count);
        }
    }
}
