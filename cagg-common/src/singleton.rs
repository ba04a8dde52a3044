// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./singleton_test.rs"]
mod singleton_test;

use futures_util::Future;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

//
// SingletonManager
//

// Process local election of named singletons. The first caller for a name runs the init future
// and every later caller shares the same instance for as long as at least one strong reference
// is alive. Once all references are dropped the next caller elects a new instance.
#[derive(Default)]
pub struct SingletonManager {
  singletons: Mutex<HashMap<String, Weak<dyn Any + Send + Sync>>>,
}

impl SingletonManager {
  pub async fn get_or_init<T: Send + Sync + 'static, E>(
    &self,
    name: &str,
    init_func: impl Future<Output = Result<Arc<T>, E>> + Send,
  ) -> Result<Arc<T>, E> {
    // The lock is held across init so concurrent callers never elect two instances.
    let mut singletons = self.singletons.lock().await;
    if let Some(existing) = singletons.get(name).and_then(Weak::upgrade) {
      match existing.downcast::<T>() {
        Ok(existing) => return Ok(existing),
        Err(_) => {
          log::error!("singleton '{name}' re-registered with a different type, replacing");
        },
      }
    }

    let elected = init_func.await?;
    log::info!("elected singleton '{name}'");
    singletons.insert(
      name.to_string(),
      Arc::downgrade(&(elected.clone() as Arc<dyn Any + Send + Sync>)),
    );
    Ok(elected)
  }

  pub async fn is_live(&self, name: &str) -> bool {
    self
      .singletons
      .lock()
      .await
      .get(name)
      .is_some_and(|weak| weak.strong_count() > 0)
  }
}
