//! Tasks, subscriptions and the notifications they produce.

pub mod model;

pub use model::{
    EventType, Subscription, SubscriptionFilter, Task, TaskCreate, TaskNotification, TaskStatus,
    TaskUpdate,
};
