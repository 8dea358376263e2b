//! Scripted in-process browser session shared by the integration tests

#![allow(dead_code)]

use ssrproxy::{Engine, Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Blocks every navigation until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn opened() -> Arc<Self> {
        let gate = Arc::new(Self::default());
        gate.open();
        gate
    }

    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

#[derive(Clone)]
pub struct FakePage {
    pub title: String,
    pub html: String,
}

/// Browser session answering from a fixed URL → page table.
pub struct FakeEngine {
    pages: HashMap<String, FakePage>,
    loads: Arc<Mutex<Vec<String>>>,
    started: mpsc::UnboundedSender<String>,
    gate: Arc<Gate>,
    current: Option<FakePage>,
}

/// Test-side handles into a [`FakeEngine`].
pub struct Script {
    pub loads: Arc<Mutex<Vec<String>>>,
    pub started: mpsc::UnboundedReceiver<String>,
    pub gate: Arc<Gate>,
}

impl Script {
    pub fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }

    pub fn loaded(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }
}

impl FakeEngine {
    pub fn new(pages: &[(&str, &str, &str)], gate: Arc<Gate>) -> (Self, Script) {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let loads = Arc::new(Mutex::new(Vec::new()));
        let pages = pages
            .iter()
            .map(|(url, title, html)| {
                (
                    url.to_string(),
                    FakePage {
                        title: title.to_string(),
                        html: html.to_string(),
                    },
                )
            })
            .collect();
        let engine = Self {
            pages,
            loads: Arc::clone(&loads),
            started: started_tx,
            gate: Arc::clone(&gate),
            current: None,
        };
        let script = Script {
            loads,
            started: started_rx,
            gate,
        };
        (engine, script)
    }

    fn current(&self) -> Result<&FakePage> {
        self.current
            .as_ref()
            .ok_or_else(|| Error::RenderError("nothing loaded".into()))
    }
}

impl Engine for FakeEngine {
    fn load_url(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        let _ = self.started.send(url.to_string());
        self.gate.wait();
        self.loads.lock().unwrap().push(url.to_string());
        self.current = self.pages.get(url).cloned();
        if self.current.is_none() {
            return Err(Error::LoadError(format!("404 for {}", url)));
        }
        Ok(())
    }

    fn wait_visible(&mut self, _selector: &str, _timeout: Duration) -> Result<()> {
        self.current().map(|_| ())
    }

    fn title(&self) -> Result<String> {
        Ok(self.current()?.title.clone())
    }

    fn inner_html(&self, _selector: &str) -> Result<String> {
        Ok(self.current()?.html.clone())
    }

    fn close(self) -> Result<()> {
        Ok(())
    }
}
