//! Filterable member list.

use std::sync::{Arc, Mutex, PoisonError};

use super::query::{Query, QueryState};
use crate::api::types::{Member, Page};
use crate::api::{with_cancel, FlockApi, MemberQuery};

/// The member list for the current filter. Changing the filter cancels the
/// request for the previous one.
pub struct MembersListHook {
  filter: Arc<Mutex<MemberQuery>>,
  query: Query<Page<Member>>,
}

impl MembersListHook {
  pub fn new(api: FlockApi, filter: MemberQuery) -> Self {
    let filter = Arc::new(Mutex::new(filter));
    let current = filter.clone();

    let query = Query::new(move |cancel| {
      let api = api.clone();
      let filter = current.lock().unwrap_or_else(PoisonError::into_inner).clone();
      async move { with_cancel(Some(&cancel), api.get_members(&filter)).await? }
    });

    Self { filter, query }
  }

  pub fn filter(&self) -> MemberQuery {
    self.filter.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Load with the current filter unless a load is already running.
  pub fn load(&mut self) {
    self.query.fetch();
  }

  /// Replace the filter and reload. Does nothing when the filter is unchanged.
  pub fn set_filter(&mut self, filter: MemberQuery) {
    {
      let mut current = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
      if *current == filter && !matches!(self.query.state(), QueryState::Idle) {
        return;
      }
      *current = filter;
    }
    self.query.refetch();
  }

  pub fn set_page(&mut self, page: u32) {
    let filter = MemberQuery {
      page: Some(page),
      ..self.filter()
    };
    self.set_filter(filter);
  }

  pub fn poll(&mut self) -> bool {
    self.query.poll()
  }

  pub async fn settle(&mut self) -> &QueryState<Page<Member>> {
    self.query.settle().await
  }

  pub fn state(&self) -> &QueryState<Page<Member>> {
    self.query.state()
  }

  pub fn members(&self) -> &[Member] {
    self
      .query
      .data()
      .map(|page| page.results.as_slice())
      .unwrap_or_default()
  }
}
