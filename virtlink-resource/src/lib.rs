// Copyright 2024 The Virtlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod backing;
pub mod directory_pool;
pub mod manager;
pub mod mounter;
pub mod nfs_pool;
pub mod pool_connection;
pub mod volume;

pub use backing::ResourceBacking;
pub use manager::ResourceManager;
pub use mounter::Mounter;
pub use pool_connection::PoolConnection;
