// Copyright Paw Proxy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exercises compose parsing against a real file on disk rather than an
//! inline string, since this is the one place the launcher reads
//! arbitrary YAML off the filesystem.

use paw_launcher::compose;
use std::collections::BTreeMap;
use std::path::Path;

#[test]
fn registers_one_route_per_published_port() {
	let content = std::fs::read_to_string("tests/fixtures/docker-compose.yml").unwrap();
	let file = compose::parse(&content).unwrap();
	let routes = compose::routes_from_compose(&file, Path::new("/srv/project"));
	let by_name: BTreeMap<_, _> = routes.into_iter().map(|r| (r.name.clone(), r)).collect();

	assert_eq!(by_name.get("web").unwrap().upstream, "127.0.0.1:8080");
	assert_eq!(by_name.get("api.9000").unwrap().upstream, "127.0.0.1:9000");
	assert_eq!(by_name.get("api.9443").unwrap().upstream, "127.0.0.1:9443");
	assert_eq!(by_name.get("db").unwrap().upstream, "127.0.0.1:5432");
	assert!(!by_name.contains_key("worker"));
	assert!(by_name.values().all(|r| r.dir == "/srv/project"));
}
