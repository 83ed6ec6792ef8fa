//! Runs a group of long-lived actors and stops all of them once one exits.

use std::future::Future;
use std::pin::Pin;

use anyhow::anyhow;
use log::{debug, info};
use tokio::task::JoinSet;

type ActorFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type StopFn = Box<dyn FnOnce(Option<&anyhow::Error>) + Send>;

struct Actor {
    name: String,
    run: ActorFuture,
    stop: StopFn,
}

/// An actor group. Each actor is a future paired with a stop callback that
/// must make the future finish.
#[derive(Default)]
pub struct Supervisor {
    actors: Vec<Actor>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, S>(&mut self, name: impl Into<String>, run: F, stop: S)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        S: FnOnce(Option<&anyhow::Error>) + Send + 'static,
    {
        self.actors.push(Actor {
            name: name.into(),
            run: Box::pin(run),
            stop: Box::new(stop),
        });
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Run every actor concurrently.
    ///
    /// When the first actor exits, every stop callback runs with that actor's
    /// error. Returns once all actors have finished, with the first error in
    /// completion order.
    pub async fn run_all(self) -> anyhow::Result<()> {
        if self.is_empty() {
            debug!("No actors to run");
            return Ok(());
        }
        let mut names = Vec::with_capacity(self.actors.len());
        let mut stops = Vec::with_capacity(self.actors.len());
        let mut set = JoinSet::new();

        for (idx, actor) in self.actors.into_iter().enumerate() {
            names.push(actor.name);
            stops.push(actor.stop);
            let run = actor.run;
            set.spawn(async move { (idx, run.await) });
        }

        let mut first_err: Option<anyhow::Error> = None;
        let mut stops = Some(stops);

        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok((idx, result)) => {
                    match &result {
                        Ok(()) => info!("{} exited", names[idx]),
                        Err(e) => info!("{} exited: {:#}", names[idx], e),
                    }
                    result
                }
                Err(join_err) => Err(anyhow!("actor task failed: {}", join_err)),
            };

            if let Some(stops) = stops.take() {
                let cause = result.as_ref().err();
                for stop in stops {
                    stop(cause);
                }
            }

            if let Err(err) = result {
                match first_err {
                    None => first_err = Some(err),
                    Some(_) => debug!("Ignoring later actor error: {:#}", err),
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
