// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prints the `MariaDB` custom resource definition as JSON, suitable for
//! `kubectl apply -f -`.

use galera_cloud_resources::crd::mariadb::v1alpha1::MariaDB;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_json::Error> {
    let crd = MariaDB::crd();
    println!("{}", serde_json::to_string_pretty(&crd)?);
    Ok(())
}
